//! Constellation-fingerprint audio identification.
//!
//! `soundprint` ingests reference tracks into a fingerprint index and
//! identifies short, possibly noisy query recordings against it. The
//! pipeline is the classic landmark scheme: a log-magnitude spectrogram,
//! sparse spectral peaks, combinatorial anchor-target hashes, and an index
//! joined with the query through time-offset histogram voting.
//!
//! # Usage
//!
//! ```no_run
//! use soundprint::{AudioSource, Config, Engine, SqliteStore};
//!
//! # fn main() -> Result<(), soundprint::EngineError> {
//! let config = Config::default();
//! let store = SqliteStore::open(&config.index)?;
//! let engine = Engine::new(config, store)?;
//!
//! let reference = AudioSource::WavFile("reference.wav".into());
//! let report = engine.ingest(&reference, "Some Title", "Some Artist")?;
//! println!("track {} with {} fingerprints", report.track_id, report.fingerprints_added);
//!
//! let query = AudioSource::WavFile("clip.wav".into());
//! let result = engine.identify(&query)?;
//! if let Some(best) = result.best {
//!     println!(
//!         "{} - {} (score {}, {:.1}s in)",
//!         best.track.artist, best.track.title, best.score, best.offset_seconds
//!     );
//! }
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
pub mod decode;
pub mod error;
pub mod fingerprint;
pub mod matcher;
pub mod peaks;
pub mod spectrogram;
pub mod store;

pub use cancel::CancelToken;
pub use config::{
    AudioConfig, Config, FingerprintConfig, IndexConfig, MatcherConfig, PeakConfig,
};
pub use decode::{AudioSource, DecodedAudio};
pub use error::{EngineError, ErrorKind};
pub use fingerprint::Landmark;
pub use matcher::Candidate;
pub use peaks::Peak;
pub use spectrogram::Spectrogram;
pub use store::{HashHit, IndexStore, SqliteStore, StoreStats, Track, TrackMeta};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of a successful ingest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub track_id: i64,
    pub fingerprints_added: usize,
}

/// The accepted best match of an identification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackMatch {
    pub track: Track,
    pub score: u32,
    /// Where the query starts inside the stored track, in seconds.
    pub offset_seconds: f32,
}

/// Outcome of an identification. `best` is `None` when no candidate passed
/// acceptance; `candidates` then is empty too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identification {
    pub best: Option<TrackMatch>,
    pub candidates: Vec<Candidate>,
}

impl Identification {
    fn empty() -> Self {
        Self {
            best: None,
            candidates: Vec::new(),
        }
    }
}

/// One unit of work for [`Engine::ingest_batch`].
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: AudioSource,
    pub title: String,
    pub artist: String,
}

/// Orchestrates ingest and identify over a shared [`IndexStore`]. The
/// engine itself is stateless besides its configuration and store handle.
pub struct Engine<S: IndexStore> {
    config: Config,
    store: Arc<S>,
}

impl<S: IndexStore> Engine<S> {
    pub fn new(config: Config, store: S) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            config,
            store: Arc::new(store),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fingerprint `source` and add it to the index as a new track.
    pub fn ingest(
        &self,
        source: &AudioSource,
        title: impl Into<String>,
        artist: impl Into<String>,
    ) -> Result<IngestReport, EngineError> {
        self.ingest_with_cancel(source, title, artist, &CancelToken::new())
    }

    /// [`Engine::ingest`] with a cancellation token checked between stages.
    /// Cancellation after the track row exists triggers the same
    /// compensating deletion as a failure.
    pub fn ingest_with_cancel(
        &self,
        source: &AudioSource,
        title: impl Into<String>,
        artist: impl Into<String>,
        cancel: &CancelToken,
    ) -> Result<IngestReport, EngineError> {
        let started = Instant::now();
        cancel.checkpoint()?;
        let (meta, landmarks) = self.prepare(source, title.into(), artist.into(), cancel)?;
        let report = self.commit(&meta, &landmarks, cancel)?;
        info!(
            track_id = report.track_id,
            title = %meta.title,
            fingerprints = report.fingerprints_added,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "track ingested"
        );
        Ok(report)
    }

    /// Ingest many sources, running the DSP stages on a worker pool. All
    /// index writes still funnel through this engine's store, one track at
    /// a time. Results come back in request order.
    pub fn ingest_batch(&self, requests: &[IngestRequest]) -> Vec<Result<IngestReport, EngineError>> {
        let cancel = CancelToken::new();
        let prepared: Vec<Result<(TrackMeta, Vec<Landmark>), EngineError>> = requests
            .par_iter()
            .map(|req| self.prepare(&req.source, req.title.clone(), req.artist.clone(), &cancel))
            .collect();

        prepared
            .into_iter()
            .map(|prep| prep.and_then(|(meta, landmarks)| self.commit(&meta, &landmarks, &cancel)))
            .collect()
    }

    /// Identify `source` against the index.
    pub fn identify(&self, source: &AudioSource) -> Result<Identification, EngineError> {
        self.identify_with_cancel(source, &CancelToken::new())
    }

    /// [`Engine::identify`] with a cancellation token checked between
    /// stages.
    pub fn identify_with_cancel(
        &self,
        source: &AudioSource,
        cancel: &CancelToken,
    ) -> Result<Identification, EngineError> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.config.identify_timeout_ms);

        let audio = source.decode()?;
        check_deadline(started, budget, &[])?;
        cancel.checkpoint()?;

        let spec = match spectrogram::compute(&audio, &self.config.audio) {
            Err(EngineError::SilentInput) => {
                debug!("silent query, returning empty identification");
                return Ok(Identification::empty());
            }
            other => other?,
        };
        check_deadline(started, budget, &[])?;
        cancel.checkpoint()?;

        let peaks = peaks::extract(&spec, &self.config.peaks, self.config.audio.db_floor);
        let landmarks = fingerprint::generate(&peaks, &self.config.fingerprint);
        debug!(
            frames = spec.num_frames(),
            peaks = peaks.len(),
            landmarks = landmarks.len(),
            "query pipeline complete"
        );
        if landmarks.is_empty() {
            return Ok(Identification::empty());
        }
        check_deadline(started, budget, &[])?;
        cancel.checkpoint()?;

        let candidates =
            matcher::match_landmarks(&landmarks, self.store.as_ref(), &self.config.matcher)?;
        check_deadline(started, budget, &candidates)?;

        let best = match candidates.first() {
            None => None,
            Some(top) => {
                let track = self
                    .store
                    .get_track(top.track_id)?
                    .ok_or(EngineError::TrackNotFound(top.track_id))?;
                Some(TrackMatch {
                    track,
                    score: top.score,
                    offset_seconds: top.offset_frames as f32 * self.config.frame_duration(),
                })
            }
        };
        info!(
            matched = best.is_some(),
            candidates = candidates.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "identification finished"
        );
        Ok(Identification { best, candidates })
    }

    /// Remove a track and all its fingerprints. Idempotent.
    pub fn delete_track(&self, track_id: i64) -> Result<(), EngineError> {
        self.store.delete_track(track_id)?;
        info!(track_id, "track deleted");
        Ok(())
    }

    pub fn stats(&self) -> Result<StoreStats, EngineError> {
        self.store.stats()
    }

    /// Run the DSP half of an ingest: decode through landmark generation.
    fn prepare(
        &self,
        source: &AudioSource,
        title: String,
        artist: String,
        cancel: &CancelToken,
    ) -> Result<(TrackMeta, Vec<Landmark>), EngineError> {
        let audio = source.decode()?;
        cancel.checkpoint()?;
        let spec = spectrogram::compute(&audio, &self.config.audio)?;
        cancel.checkpoint()?;
        let peaks = peaks::extract(&spec, &self.config.peaks, self.config.audio.db_floor);
        cancel.checkpoint()?;
        let landmarks = fingerprint::generate(&peaks, &self.config.fingerprint);
        let meta = TrackMeta {
            title,
            artist,
            duration_frames: spec.num_frames() as u32,
        };
        Ok((meta, landmarks))
    }

    /// Create the track row and insert its fingerprints. Any failure or
    /// cancellation after the row exists deletes it again, so the store
    /// never keeps a half-ingested track.
    fn commit(
        &self,
        meta: &TrackMeta,
        landmarks: &[Landmark],
        cancel: &CancelToken,
    ) -> Result<IngestReport, EngineError> {
        cancel.checkpoint()?;
        let track_id = self.store.create_track(meta)?;
        let outcome = cancel
            .checkpoint()
            .and_then(|()| self.store.insert_fingerprints(track_id, landmarks));
        match outcome {
            Ok(fingerprints_added) => Ok(IngestReport {
                track_id,
                fingerprints_added,
            }),
            Err(err) => {
                if let Err(cleanup) = self.store.delete_track(track_id) {
                    warn!(track_id, error = %cleanup, "compensating delete failed");
                }
                Err(err)
            }
        }
    }
}

fn check_deadline(
    started: Instant,
    budget: Duration,
    tentative: &[Candidate],
) -> Result<(), EngineError> {
    if started.elapsed() > budget {
        Err(EngineError::Timeout {
            elapsed_ms: started.elapsed().as_millis() as u64,
            tentative: tentative.to_vec(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    const SR: u32 = 22_050;
    const HOP: f64 = 512.0;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    fn engine() -> Engine<SqliteStore> {
        init_tracing();
        let config = Config::default();
        let store = SqliteStore::open(&config.index).unwrap();
        Engine::new(config, store).unwrap()
    }

    fn source(samples: Vec<f32>) -> AudioSource {
        AudioSource::RawPcm {
            samples,
            sample_rate: SR,
            channels: 1,
        }
    }

    /// Linear sine sweep 100 Hz to 8 kHz with a gentle tremolo. The
    /// tremolo keeps the peak cadence dense and regular, which a constant
    /// envelope does not guarantee.
    fn sweep(duration: f64) -> Vec<f32> {
        let n = (duration * SR as f64) as usize;
        let rate = (8_000.0 - 100.0) / duration;
        (0..n)
            .map(|i| {
                let t = i as f64 / SR as f64;
                let phase = 2.0 * PI * (100.0 * t + 0.5 * rate * t * t);
                let tremolo = 1.0 + 0.25 * (2.0 * PI * 3.7 * t).sin();
                (0.6 * tremolo * phase.sin()) as f32
            })
            .collect()
    }

    struct XorShift64(u64);

    impl XorShift64 {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }

        fn next_f32(&mut self) -> f32 {
            ((self.next() >> 11) as f64 / (1u64 << 53) as f64 * 2.0 - 1.0) as f32
        }
    }

    /// Pink-ish noise from a handful of octave-held white rows.
    fn pink_noise(duration: f64, seed: u64) -> Vec<f32> {
        let mut rng = XorShift64(seed);
        let n = (duration * SR as f64) as usize;
        let mut rows = [0.0f32; 6];
        (0..n)
            .map(|i| {
                for (k, row) in rows.iter_mut().enumerate() {
                    if i % (1usize << k) == 0 {
                        *row = rng.next_f32();
                    }
                }
                0.35 * rows.iter().sum::<f32>() / rows.len() as f32
            })
            .collect()
    }

    fn clip(samples: &[f32], from_seconds: f64, to_seconds: f64) -> Vec<f32> {
        let from = (from_seconds * SR as f64) as usize;
        let to = ((to_seconds * SR as f64) as usize).min(samples.len());
        samples[from..to].to_vec()
    }

    fn mix_with_white_noise(signal: &[f32], snr_db: f32, seed: u64) -> Vec<f32> {
        let mut rng = XorShift64(seed);
        let noise: Vec<f32> = (0..signal.len()).map(|_| rng.next_f32()).collect();
        let signal_power =
            signal.iter().map(|s| s * s).sum::<f32>() / signal.len() as f32;
        let noise_power = noise.iter().map(|s| s * s).sum::<f32>() / noise.len() as f32;
        let scale = (signal_power / 10f32.powf(snr_db / 10.0) / noise_power).sqrt();
        signal
            .iter()
            .zip(&noise)
            .map(|(s, n)| s + scale * n)
            .collect()
    }

    #[test]
    fn identity_round_trip() {
        let engine = engine();
        let audio = sweep(30.0);
        let report = engine.ingest(&source(audio.clone()), "sweep-1", "synth").unwrap();
        assert!(report.fingerprints_added > 0);

        let result = engine.identify(&source(audio)).unwrap();
        let best = result.best.expect("own buffer must identify");
        assert_eq!(best.track.id, report.track_id);
        assert_eq!(best.track.title, "sweep-1");
        assert_eq!(result.candidates[0].offset_frames, 0);
        assert!(best.score >= 50, "score {}", best.score);
    }

    #[test]
    fn sub_clip_reports_its_start_offset() {
        let engine = engine();
        let audio = sweep(30.0);
        let report = engine.ingest(&source(audio.clone()), "sweep-1", "synth").unwrap();

        let result = engine.identify(&source(clip(&audio, 12.0, 22.0))).unwrap();
        let best = result.best.expect("sub-clip must identify");
        assert_eq!(best.track.id, report.track_id);
        assert!(best.score >= 5);

        let expected_frames = 12.0 * SR as f64 / HOP;
        let got = result.candidates[0].offset_frames as f64;
        assert!(
            (got - expected_frames).abs() <= 1.5,
            "offset {got} vs {expected_frames}"
        );
    }

    #[test]
    fn two_tracks_disambiguate_under_gain() {
        let engine = engine();
        let sweep_audio = sweep(30.0);
        let pink_audio = pink_noise(30.0, 0x5eed_1234_dead_beef);
        engine.ingest(&source(sweep_audio), "sweep-1", "synth").unwrap();
        let pink_report = engine
            .ingest(&source(pink_audio.clone()), "pink-1", "synth")
            .unwrap();

        let boosted: Vec<f32> = clip(&pink_audio, 5.0, 15.0)
            .iter()
            .map(|s| s * 2.0)
            .collect();
        let result = engine.identify(&source(boosted)).unwrap();
        let best = result.best.expect("boosted pink clip must identify");
        assert_eq!(best.track.id, pink_report.track_id);
    }

    #[test]
    fn survives_added_white_noise() {
        let engine = engine();
        let audio = sweep(30.0);
        let report = engine.ingest(&source(audio.clone()), "sweep-1", "synth").unwrap();

        let clean = clip(&audio, 0.0, 10.0);
        let clean_score = engine
            .identify(&source(clean.clone()))
            .unwrap()
            .best
            .expect("clean clip must identify")
            .score;

        let noisy = mix_with_white_noise(&clean, 10.0, 0x0123_4567_89ab_cdef);
        let result = engine.identify(&source(noisy)).unwrap();
        let best = result.best.expect("noisy clip must identify");
        assert_eq!(best.track.id, report.track_id);
        assert!(
            best.score * 2 >= clean_score,
            "noisy {} vs clean {clean_score}",
            best.score
        );
    }

    #[test]
    fn silence_yields_an_empty_result() {
        let engine = engine();
        engine.ingest(&source(sweep(10.0)), "sweep-1", "synth").unwrap();

        let result = engine.identify(&source(vec![0.0; 5 * SR as usize])).unwrap();
        assert!(result.best.is_none());
        assert!(result.candidates.is_empty());
    }

    #[test]
    fn unknown_audio_is_rejected() {
        let engine = engine();
        engine.ingest(&source(sweep(30.0)), "sweep-1", "synth").unwrap();

        let stranger = pink_noise(10.0, 0xfeed_f00d_0dd5_7777);
        let result = engine.identify(&source(stranger)).unwrap();
        assert!(result.best.is_none(), "got {:?}", result.best);
    }

    #[test]
    fn deleted_track_stops_matching() {
        let engine = engine();
        let audio = sweep(20.0);
        let report = engine.ingest(&source(audio.clone()), "sweep-1", "synth").unwrap();

        engine.delete_track(report.track_id).unwrap();
        let result = engine.identify(&source(audio)).unwrap();
        assert!(result.best.is_none());

        let stats = engine.stats().unwrap();
        assert_eq!(stats.tracks, 0);
        assert_eq!(stats.fingerprints, 0);
    }

    #[test]
    fn ingesting_silence_is_an_error() {
        let engine = engine();
        let err = engine
            .ingest(&source(vec![0.0; SR as usize]), "null", "nobody")
            .unwrap_err();
        assert!(matches!(err, EngineError::SilentInput));
        assert_eq!(engine.stats().unwrap().tracks, 0);
    }

    #[test]
    fn batch_ingest_matches_single_ingest() {
        let engine = engine();
        let requests = vec![
            IngestRequest {
                source: source(sweep(8.0)),
                title: "batch-sweep".into(),
                artist: "synth".into(),
            },
            IngestRequest {
                source: source(pink_noise(8.0, 42)),
                title: "batch-pink".into(),
                artist: "synth".into(),
            },
            IngestRequest {
                source: source(vec![0.0; SR as usize]),
                title: "batch-silence".into(),
                artist: "synth".into(),
            },
        ];
        let results = engine.ingest_batch(&requests);
        assert!(results[0].is_ok());
        assert!(results[1].is_ok());
        assert!(matches!(results[2], Err(EngineError::SilentInput)));
        assert_eq!(engine.stats().unwrap().tracks, 2);
    }

    #[test]
    fn zero_budget_times_out() {
        init_tracing();
        let mut config = Config::default();
        config.identify_timeout_ms = 0;
        let store = SqliteStore::open(&config.index).unwrap();
        let engine = Engine::new(config, store).unwrap();

        let err = engine.identify(&source(sweep(2.0))).unwrap_err();
        assert!(matches!(err, EngineError::Timeout { .. }));
    }

    #[test]
    fn cancelled_ingest_leaves_no_track_behind() {
        let engine = engine();
        let token = CancelToken::new();
        token.cancel();
        let err = engine
            .ingest_with_cancel(&source(sweep(5.0)), "nope", "nobody", &token)
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
        assert_eq!(engine.stats().unwrap().tracks, 0);
    }

    /// A store decorator whose fingerprint inserts always fail, simulating
    /// a crash between track creation and fingerprint insertion.
    struct FailingInserts {
        inner: SqliteStore,
    }

    impl IndexStore for FailingInserts {
        fn create_track(&self, meta: &TrackMeta) -> Result<i64, EngineError> {
            self.inner.create_track(meta)
        }

        fn insert_fingerprints(
            &self,
            _track_id: i64,
            _landmarks: &[Landmark],
        ) -> Result<usize, EngineError> {
            Err(EngineError::InvalidInput("injected insert failure".into()))
        }

        fn delete_track(&self, track_id: i64) -> Result<(), EngineError> {
            self.inner.delete_track(track_id)
        }

        fn lookup(&self, hash: u32) -> Result<Vec<(i64, u32)>, EngineError> {
            self.inner.lookup(hash)
        }

        fn lookup_many(&self, hashes: &[u32]) -> Result<Vec<HashHit>, EngineError> {
            self.inner.lookup_many(hashes)
        }

        fn get_track(&self, track_id: i64) -> Result<Option<Track>, EngineError> {
            self.inner.get_track(track_id)
        }

        fn list_tracks(&self) -> Result<Vec<Track>, EngineError> {
            self.inner.list_tracks()
        }

        fn stats(&self) -> Result<StoreStats, EngineError> {
            self.inner.stats()
        }

        fn optimize(&self) -> Result<(), EngineError> {
            self.inner.optimize()
        }
    }

    #[test]
    fn failed_insert_triggers_compensating_delete() {
        init_tracing();
        let config = Config::default();
        let store = FailingInserts {
            inner: SqliteStore::open(&config.index).unwrap(),
        };
        let engine = Engine::new(config, store).unwrap();

        let err = engine
            .ingest(&source(sweep(5.0)), "doomed", "nobody")
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));

        let stats = engine.store().inner.stats().unwrap();
        assert_eq!(stats.tracks, 0);
        assert_eq!(stats.fingerprints, 0);
    }

    #[test]
    fn pipeline_is_deterministic_end_to_end() {
        let config = Config::default();
        let audio = DecodedAudio {
            samples: sweep(5.0),
            sample_rate: SR,
            channels: 1,
        };
        let run = || {
            let spec = spectrogram::compute(&audio, &config.audio).unwrap();
            let peaks = peaks::extract(&spec, &config.peaks, config.audio.db_floor);
            fingerprint::generate(&peaks, &config.fingerprint)
        };
        assert_eq!(run(), run());
    }
}
