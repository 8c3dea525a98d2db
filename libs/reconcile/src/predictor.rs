//! Version predictor.
//!
//! Given every release of one module, sorted ascending by semantic version,
//! decide which release is live, which one should go live next and which
//! pending releases are obsolete and can be superseded without ever being
//! activated.
//!
//! The rule is "newest pending wins": every pending release strictly older
//! than the newest pending release is skipped, and so is every pending
//! release that is not newer than the deployed one. Activating an old patch
//! only to replace it on the very next pass is wasted work and an extra
//! restart.

use semver::Version;

use crate::phase::Phase;

/// Result of a prediction pass. All values are indexes into the input slice.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prediction {
    /// The release currently in `Deployed`.
    pub current: Option<usize>,

    /// The release that should become `Deployed` next.
    pub desired: Option<usize>,

    /// Pending releases to mark `Superseded` directly.
    pub skipped: Vec<usize>,

    /// Older `Deployed` releases shadowed by `current`.
    pub stale: Vec<usize>,

    /// True when the pending releases newer than `current` span more than
    /// one (major, minor) line.
    pub crosses_minor_lines: bool,
}

impl Prediction {
    /// The deployed release, when nothing newer is waiting to replace it.
    pub fn settled(&self) -> Option<usize> {
        match self.desired {
            None => self.current,
            Some(_) => None,
        }
    }
}

/// Run the predictor over a module's releases.
///
/// `releases` must be sorted ascending by version; `view` extracts the
/// version and phase of each element.
pub fn predict<T, F>(releases: &[T], view: F) -> Prediction
where
    F: Fn(&T) -> (&Version, Option<Phase>),
{
    let mut prediction = Prediction::default();

    for (index, release) in releases.iter().enumerate() {
        let (_, phase) = view(release);
        if phase == Some(Phase::Deployed) {
            if let Some(previous) = prediction.current.replace(index) {
                prediction.stale.push(previous);
            }
        }
    }

    let current_version = prediction.current.map(|i| view(&releases[i]).0);

    let mut candidates = Vec::new();
    for (index, release) in releases.iter().enumerate() {
        let (version, phase) = view(release);
        if phase != Some(Phase::Pending) {
            continue;
        }

        match current_version {
            Some(current) if version <= current => prediction.skipped.push(index),
            _ => candidates.push(index),
        }
    }

    // Pick the highest version rather than the last index so a mis-sorted
    // input can never select an older release.
    let desired = candidates
        .iter()
        .copied()
        .max_by(|a, b| view(&releases[*a]).0.cmp(view(&releases[*b]).0));

    if let Some(desired) = desired {
        let lines: std::collections::BTreeSet<(u64, u64)> = candidates
            .iter()
            .map(|i| {
                let v = view(&releases[*i]).0;
                (v.major, v.minor)
            })
            .collect();
        prediction.crosses_minor_lines = lines.len() > 1;

        prediction
            .skipped
            .extend(candidates.into_iter().filter(|i| *i != desired));
        prediction.desired = Some(desired);
    }

    prediction.skipped.sort_unstable();
    prediction
}
