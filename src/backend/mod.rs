//! Injection backends
//!
//! Every backend tracks what it is holding down so that a press of a held key
//! or a release of a free key is a no-op, and `release_all` lets go of
//! exactly what is still held.

use crate::config::Config;
use crate::key::{ButtonId, KeyIdentifier};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use thiserror::Error;
use tracing::{info, warn};

pub mod dry_run;
pub mod fallback;
pub mod humanized;
pub mod joystick;
pub mod raw;

pub use dry_run::{BackendCall, DryRunBackend};
pub use fallback::FallbackBackend;
pub use humanized::Humanized;
pub use joystick::DualJoystick;
pub use raw::RawBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{backend} backend unavailable: {reason}")]
    Unavailable {
        backend: &'static str,
        reason: String,
    },
    #[error("no mapping for key {0}")]
    UnknownKey(KeyIdentifier),
    #[error("no mapping for pointer button {0}")]
    UnknownButton(ButtonId),
    #[error("injection failed: {0}")]
    Io(#[from] io::Error),
    #[error("injection failed: {0}")]
    Injection(String),
}

impl BackendError {
    pub fn unavailable(backend: &'static str, reason: impl fmt::Display) -> Self {
        BackendError::Unavailable {
            backend,
            reason: reason.to_string(),
        }
    }
}

/// The capabilities replay needs from an injector
pub trait Backend {
    fn name(&self) -> &'static str;
    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError>;
    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError>;
    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError>;
    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError>;
    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError>;
    /// Positive `dy` scrolls up, positive `dx` scrolls right
    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError>;
    /// Release everything still held. Keeps going after a failed release and
    /// reports the first failure.
    fn release_all(&mut self) -> Result<(), BackendError>;
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        (**self).key_down(key)
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        (**self).key_up(key)
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        (**self).pointer_move_relative(dx, dy)
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        (**self).pointer_down(button)
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        (**self).pointer_up(button)
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        (**self).scroll(dx, dy)
    }

    fn release_all(&mut self) -> Result<(), BackendError> {
        (**self).release_all()
    }
}

/// What a backend is holding, and the resource each held item occupies
#[derive(Debug, Clone)]
pub struct Held<K: Ord, V> {
    items: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for Held<K, V> {
    fn default() -> Self {
        Self {
            items: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> Held<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.items.contains_key(key)
    }

    pub fn insert(&mut self, key: K, resource: V) {
        self.items.insert(key, resource);
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key)
    }

    pub fn release(&mut self, key: &K) -> Option<V> {
        self.items.remove(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.items.iter()
    }

    pub fn drain(&mut self) -> Vec<(K, V)> {
        std::mem::take(&mut self.items).into_iter().collect()
    }
}

/// Remember the first error of a batch while letting the batch finish
pub(crate) fn keep_first(first: &mut Option<BackendError>, result: Result<(), BackendError>) {
    if let Err(e) = result {
        warn!(error = %e, "release failed");
        first.get_or_insert(e);
    }
}

pub(crate) fn first_error(first: Option<BackendError>) -> Result<(), BackendError> {
    match first {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Which family of backends a replay should use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Direct uinput keyboard and mouse
    Native,
    /// Native with reaction pauses and jittered pointer paths
    Human,
    /// Keys and pointer mapped onto two virtual joysticks
    Joystick,
    /// Cross-platform simulation through enigo
    Fallback,
}

impl fmt::Display for BackendMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendMode::Native => "native",
            BackendMode::Human => "human",
            BackendMode::Joystick => "joystick",
            BackendMode::Fallback => "fallback",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no {mode} backend could be initialized: {}", summarize(.failures))]
    NoBackendAvailable {
        mode: String,
        failures: Vec<(&'static str, BackendError)>,
    },
}

fn summarize(failures: &[(&'static str, BackendError)]) -> String {
    failures
        .iter()
        .map(|(name, e)| format!("{}: {}", name, e))
        .collect::<Vec<_>>()
        .join("; ")
}

type Constructor<'a> = Box<dyn FnOnce() -> Result<Box<dyn Backend>, BackendError> + 'a>;

/// A named way to build a backend, tried in preference order
pub struct Candidate<'a> {
    pub name: &'static str,
    build: Constructor<'a>,
}

impl<'a> Candidate<'a> {
    pub fn new<F>(name: &'static str, build: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Backend>, BackendError> + 'a,
    {
        Self {
            name,
            build: Box::new(build),
        }
    }
}

/// Use the first candidate that constructs
pub fn select(mode: &str, candidates: Vec<Candidate<'_>>) -> Result<Box<dyn Backend>, SelectError> {
    let mut failures = Vec::new();
    for candidate in candidates {
        match (candidate.build)() {
            Ok(backend) => {
                info!(backend = candidate.name, mode, "backend ready");
                return Ok(backend);
            }
            Err(e) => {
                warn!(backend = candidate.name, error = %e, "backend unavailable, trying next");
                failures.push((candidate.name, e));
            }
        }
    }
    Err(SelectError::NoBackendAvailable {
        mode: mode.to_string(),
        failures,
    })
}

/// Preference chain for each mode, always ending at the enigo fallback
pub fn candidates(mode: BackendMode, config: &Config) -> Vec<Candidate<'_>> {
    let raw = || -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(RawBackend::open(&config.replay.device_name)?))
    };
    let fallback = || -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(FallbackBackend::new()?))
    };

    match mode {
        BackendMode::Native => vec![
            Candidate::new("raw", raw),
            Candidate::new("fallback", fallback),
        ],
        BackendMode::Human => vec![
            Candidate::new("humanized-raw", move || {
                Ok(Box::new(Humanized::new(raw()?, config.humanize.clone())) as Box<dyn Backend>)
            }),
            Candidate::new("humanized-fallback", move || {
                let inner = fallback()?;
                Ok(Box::new(Humanized::new(inner, config.humanize.clone())) as Box<dyn Backend>)
            }),
        ],
        BackendMode::Joystick => vec![
            Candidate::new("dual-joystick", move || {
                Ok(Box::new(DualJoystick::open(&config.joystick)?) as Box<dyn Backend>)
            }),
            Candidate::new("raw", raw),
            Candidate::new("fallback", fallback),
        ],
        BackendMode::Fallback => vec![Candidate::new("fallback", fallback)],
    }
}

pub fn open_backend(mode: BackendMode, config: &Config) -> Result<Box<dyn Backend>, SelectError> {
    select(&mode.to_string(), candidates(mode, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing(name: &'static str) -> Candidate<'static> {
        Candidate::new(name, move || Err(BackendError::unavailable(name, "device missing")))
    }

    #[test]
    fn test_select_falls_through_to_first_working() {
        let backend = select(
            "test",
            vec![
                failing("joystick"),
                failing("raw"),
                Candidate::new("dry-run", || {
                    Ok(Box::new(DryRunBackend::new()) as Box<dyn Backend>)
                }),
            ],
        )
        .unwrap();
        assert_eq!(backend.name(), "dry-run");
    }

    #[test]
    fn test_select_reports_every_failure() {
        let err = select("native", vec![failing("raw"), failing("fallback")])
            .err()
            .unwrap();
        let SelectError::NoBackendAvailable { failures, .. } = &err;
        assert_eq!(failures.len(), 2);
        let message = err.to_string();
        assert!(message.contains("raw"));
        assert!(message.contains("fallback"));
    }

    #[test]
    fn test_later_candidates_not_built_after_success() {
        let mut built_second = false;
        {
            let candidates = vec![
                Candidate::new("first", || Ok(Box::new(DryRunBackend::new()) as Box<dyn Backend>)),
                Candidate::new("second", || {
                    built_second = true;
                    Ok(Box::new(DryRunBackend::new()) as Box<dyn Backend>)
                }),
            ];
            select("test", candidates).unwrap();
        }
        assert!(!built_second);
    }

    #[test]
    fn test_every_chain_ends_at_fallback() {
        let config = Config::default();
        for mode in [
            BackendMode::Native,
            BackendMode::Human,
            BackendMode::Joystick,
            BackendMode::Fallback,
        ] {
            let chain = candidates(mode, &config);
            assert!(chain.last().unwrap().name.ends_with("fallback"));
        }
    }

    #[test]
    fn test_held_drain_empties() {
        let mut held: Held<KeyIdentifier, u16> = Held::new();
        held.insert(KeyIdentifier::Char('w'), 17);
        held.insert(KeyIdentifier::Char('a'), 30);
        assert!(held.contains(&KeyIdentifier::Char('w')));
        assert_eq!(held.drain().len(), 2);
        assert!(held.is_empty());
    }
}
