//! Human-like pacing on top of any backend
//!
//! Each call waits a short random reaction delay first. Pointer moves are
//! split into jittered sub-moves so the path is not a single jump.

use super::{Backend, BackendError};
use crate::config::HumanizeConfig;
use crate::key::{ButtonId, KeyIdentifier};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::thread;
use std::time::Duration;

type SleepFn = Box<dyn FnMut(Duration)>;

pub struct Humanized<B> {
    inner: B,
    config: HumanizeConfig,
    rng: StdRng,
    sleep: SleepFn,
}

/// Sub-move count for a pointer move of `distance` pixels
pub fn num_steps(distance: f64, config: &HumanizeConfig) -> u32 {
    let steps = (distance / config.step_px).round();
    (steps as u32).clamp(1, config.max_steps.max(1))
}

impl<B: Backend> Humanized<B> {
    pub fn new(inner: B, config: HumanizeConfig) -> Self {
        Self {
            inner,
            config,
            rng: StdRng::from_entropy(),
            sleep: Box::new(thread::sleep),
        }
    }

    /// Deterministic jitter for reproducible runs
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_sleep(mut self, sleep: impl FnMut(Duration) + 'static) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        if high > low {
            self.rng.gen_range(low..=high)
        } else {
            low
        }
    }

    fn pause(&mut self) {
        let ms = self.uniform(self.config.pause_min_ms, self.config.pause_max_ms);
        if ms > 0.0 {
            (self.sleep)(Duration::from_secs_f64(ms / 1000.0));
        }
    }

    fn step_sleep(&mut self, distance: f64) {
        let base = self.uniform(self.config.step_sleep_min_ms, self.config.step_sleep_max_ms);
        let ms = (base * distance / 100.0).min(self.config.step_sleep_cap_ms);
        if ms > 1.0 {
            (self.sleep)(Duration::from_secs_f64(ms / 1000.0));
        }
    }
}

impl<B: Backend> Backend for Humanized<B> {
    fn name(&self) -> &'static str {
        "humanized"
    }

    fn key_down(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        self.pause();
        self.inner.key_down(key)
    }

    fn key_up(&mut self, key: &KeyIdentifier) -> Result<(), BackendError> {
        self.pause();
        self.inner.key_up(key)
    }

    fn pointer_move_relative(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        if dx == 0 && dy == 0 {
            return Ok(());
        }
        self.pause();

        let distance = f64::from(dx).hypot(f64::from(dy));
        let steps = num_steps(distance, &self.config);
        if steps == 1 {
            return self.inner.pointer_move_relative(dx, dy);
        }

        let step_x = f64::from(dx) / f64::from(steps);
        let step_y = f64::from(dy) / f64::from(steps);
        let jitter = self.config.jitter_px;
        // Fractions left over after rounding are carried into the next step
        let (mut carry_x, mut carry_y) = (0.0, 0.0);

        for _ in 0..steps {
            carry_x += step_x + self.uniform(-jitter, jitter);
            carry_y += step_y + self.uniform(-jitter, jitter);
            let (move_x, move_y) = (carry_x.round(), carry_y.round());
            carry_x -= move_x;
            carry_y -= move_y;

            self.inner.pointer_move_relative(move_x as i32, move_y as i32)?;
            self.step_sleep(distance);
        }
        Ok(())
    }

    fn pointer_down(&mut self, button: ButtonId) -> Result<(), BackendError> {
        self.pause();
        self.inner.pointer_down(button)
    }

    fn pointer_up(&mut self, button: ButtonId) -> Result<(), BackendError> {
        self.pause();
        self.inner.pointer_up(button)
    }

    fn scroll(&mut self, dx: i32, dy: i32) -> Result<(), BackendError> {
        self.pause();
        self.inner.scroll(dx, dy)
    }

    /// No reaction delay: letting go must not wait
    fn release_all(&mut self) -> Result<(), BackendError> {
        self.inner.release_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, DryRunBackend};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn humanized() -> (Humanized<DryRunBackend>, Rc<RefCell<Vec<Duration>>>) {
        let sleeps = Rc::new(RefCell::new(Vec::new()));
        let recorded = Rc::clone(&sleeps);
        let backend = Humanized::new(DryRunBackend::new(), HumanizeConfig::default())
            .with_seed(7)
            .with_sleep(move |d| recorded.borrow_mut().push(d));
        (backend, sleeps)
    }

    fn moves(backend: &Humanized<DryRunBackend>) -> Vec<(i32, i32)> {
        backend
            .inner()
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                BackendCall::PointerMove(x, y) => Some((x, y)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_num_steps_bounds() {
        let config = HumanizeConfig::default();
        assert_eq!(num_steps(0.0, &config), 1);
        assert_eq!(num_steps(10.0, &config), 1);
        assert_eq!(num_steps(45.0, &config), 3);
        assert_eq!(num_steps(10_000.0, &config), 20);
    }

    #[test]
    fn test_every_call_pauses_within_bounds() {
        let (mut backend, sleeps) = humanized();
        let w = KeyIdentifier::Char('w');
        backend.key_down(&w).unwrap();
        backend.key_up(&w).unwrap();
        backend.scroll(0, 1).unwrap();

        let sleeps = sleeps.borrow();
        assert_eq!(sleeps.len(), 3);
        for d in sleeps.iter() {
            assert!(*d >= Duration::from_millis(10));
            assert!(*d <= Duration::from_millis(40));
        }
    }

    #[test]
    fn test_long_move_is_split_and_lands_near_target() {
        let (mut backend, sleeps) = humanized();
        backend.pointer_move_relative(300, -150).unwrap();

        let moves = moves(&backend);
        assert_eq!(moves.len(), 20);
        let (sum_x, sum_y) = moves
            .iter()
            .fold((0, 0), |(sx, sy), (x, y)| (sx + x, sy + y));
        // Per-step jitter of ±1.5px over 20 steps
        assert!((sum_x - 300).abs() <= 31);
        assert!((sum_y + 150).abs() <= 31);

        // One reaction pause, then capped step sleeps
        let sleeps = sleeps.borrow();
        for d in sleeps.iter().skip(1) {
            assert!(*d <= Duration::from_millis(10));
        }
    }

    #[test]
    fn test_step_sleep_grows_with_distance() {
        let config = HumanizeConfig {
            pause_min_ms: 0.0,
            pause_max_ms: 0.0,
            step_sleep_min_ms: 2.0,
            step_sleep_max_ms: 2.0,
            step_sleep_cap_ms: 100.0,
            ..HumanizeConfig::default()
        };
        let sleeps_for = |dx: i32| {
            let sleeps = Rc::new(RefCell::new(Vec::new()));
            let recorded = Rc::clone(&sleeps);
            let mut backend = Humanized::new(DryRunBackend::new(), config.clone())
                .with_seed(3)
                .with_sleep(move |d| recorded.borrow_mut().push(d));
            backend.pointer_move_relative(dx, 0).unwrap();
            let sleeps = sleeps.borrow().clone();
            sleeps
        };

        // 2ms per 100px of travel, once per sub-move
        let short = sleeps_for(150);
        assert_eq!(short.len(), 10);
        assert!(short.iter().all(|d| (d.as_secs_f64() - 0.003).abs() < 1e-6));
        let long = sleeps_for(300);
        assert_eq!(long.len(), 20);
        assert!(long.iter().all(|d| (d.as_secs_f64() - 0.006).abs() < 1e-6));
    }

    #[test]
    fn test_short_move_passes_through() {
        let (mut backend, _) = humanized();
        backend.pointer_move_relative(4, 3).unwrap();
        assert_eq!(moves(&backend), vec![(4, 3)]);
    }

    #[test]
    fn test_zero_move_does_nothing() {
        let (mut backend, sleeps) = humanized();
        backend.pointer_move_relative(0, 0).unwrap();
        assert!(moves(&backend).is_empty());
        assert!(sleeps.borrow().is_empty());
    }

    #[test]
    fn test_release_all_goes_straight_through() {
        let (mut backend, sleeps) = humanized();
        backend.key_down(&KeyIdentifier::Char('w')).unwrap();
        backend.release_all().unwrap();
        assert_eq!(sleeps.borrow().len(), 1);
        assert_eq!(
            backend.inner().calls().last(),
            Some(&BackendCall::KeyUp(KeyIdentifier::Char('w')))
        );
    }

    #[test]
    fn test_wraps_boxed_backend() {
        let boxed: Box<dyn Backend> = Box::new(DryRunBackend::new());
        let mut backend = Humanized::new(boxed, HumanizeConfig::default()).with_sleep(|_| {});
        backend.pointer_down(ButtonId::Left).unwrap();
        backend.release_all().unwrap();
    }
}
