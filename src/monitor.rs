//! Stopping policy for the alternating phase.
//!
//! After every epoch the monitor compares the new hard labels with the
//! previous ones. A run is stable once the changed fraction stays at or below
//! `tolerance` for `patience` consecutive epochs; a single quiet epoch is not
//! enough.

use crate::{Error, Result};

/// What the optimizer should do after an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Continue,
    /// Assignments were stable for `patience` epochs.
    Converged,
    /// `max_epochs` epochs were observed without convergence.
    BudgetExhausted,
}

/// Counts consecutive stable epochs against an epoch budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvergenceMonitor {
    tolerance: f64,
    patience: usize,
    max_epochs: usize,
    observed: usize,
    stable: usize,
    last_change: Option<f64>,
}

impl ConvergenceMonitor {
    /// # Errors
    ///
    /// [`Error::Configuration`] if `tolerance` is outside `[0, 1]`, or
    /// `patience` or `max_epochs` is 0.
    pub fn new(tolerance: f64, patience: usize, max_epochs: usize) -> Result<Self> {
        if !(0.0..=1.0).contains(&tolerance) {
            return Err(Error::Configuration {
                field: "tolerance",
                reason: format!("must lie in [0, 1], got {tolerance}"),
            });
        }
        if patience == 0 {
            return Err(Error::Configuration {
                field: "patience",
                reason: "must be >= 1".into(),
            });
        }
        if max_epochs == 0 {
            return Err(Error::Configuration {
                field: "clustering_epochs",
                reason: "must be >= 1".into(),
            });
        }
        Ok(Self {
            tolerance,
            patience,
            max_epochs,
            observed: 0,
            stable: 0,
            last_change: None,
        })
    }

    /// Record one epoch.
    ///
    /// ```rust
    /// use deepclust::monitor::{ConvergenceMonitor, Decision};
    ///
    /// let mut monitor = ConvergenceMonitor::new(0.0, 2, 10).unwrap();
    /// assert_eq!(monitor.observe(&[0, 1], &[1, 1]).unwrap(), Decision::Continue);
    /// assert_eq!(monitor.observe(&[1, 1], &[1, 1]).unwrap(), Decision::Continue);
    /// assert_eq!(monitor.observe(&[1, 1], &[1, 1]).unwrap(), Decision::Converged);
    /// ```
    ///
    /// # Errors
    ///
    /// [`Error::DimensionMismatch`] if the label sequences differ in length.
    pub fn observe(&mut self, previous: &[usize], current: &[usize]) -> Result<Decision> {
        let change = change_fraction(previous, current)?;
        self.observed += 1;
        self.last_change = Some(change);
        if change <= self.tolerance {
            self.stable += 1;
        } else {
            self.stable = 0;
        }

        Ok(if self.stable >= self.patience {
            Decision::Converged
        } else if self.observed >= self.max_epochs {
            Decision::BudgetExhausted
        } else {
            Decision::Continue
        })
    }

    /// Epochs observed so far.
    pub fn observed(&self) -> usize {
        self.observed
    }

    /// Current run of consecutive stable epochs.
    pub fn stable_epochs(&self) -> usize {
        self.stable
    }

    /// Changed fraction of the most recent observation.
    pub fn last_change(&self) -> Option<f64> {
        self.last_change
    }
}

/// Fraction of positions whose label differs.
pub fn change_fraction(previous: &[usize], current: &[usize]) -> Result<f64> {
    if previous.len() != current.len() {
        return Err(Error::DimensionMismatch(previous.len(), current.len()));
    }
    if current.is_empty() {
        return Ok(0.0);
    }
    let changed = previous.iter().zip(current).filter(|(a, b)| a != b).count();
    Ok(changed as f64 / current.len() as f64)
}
