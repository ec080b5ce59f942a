//! Fault injection for the fragment path
//!
//! Rules are armed per device and consulted by the splitter at three
//! points: staging allocation, work-queue submission and fragment
//! completion.

use parking_lot::Mutex;
use tracing::warn;

/// Where in the fragment path a fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The engine call succeeds but the fragment reports failure
    Completion,
    /// The fragment cannot be queued
    Submission,
    /// The read staging buffer cannot be allocated
    Allocation,
}

/// Which fragments a fault applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// Fragment with this index, once
    Fragment(usize),
    /// The next `n` fragments seen, whatever their index
    NextFragments(usize),
    /// Every fragment until cleared
    All,
}

#[derive(Debug, Clone)]
struct FaultRule {
    kind: FaultKind,
    target: FaultTarget,
}

/// Armed fault rules for one device
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<FaultRule>>,
}

impl FaultInjector {
    /// Create an injector with nothing armed
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a rule
    pub fn arm(&self, kind: FaultKind, target: FaultTarget) {
        warn!("Arming {:?} fault for {:?}", kind, target);
        self.rules.lock().push(FaultRule { kind, target });
    }

    /// Disarm every rule
    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    /// Consume a matching rule for fragment `index`, if any
    pub fn should_fail(&self, kind: FaultKind, index: usize) -> bool {
        let mut rules = self.rules.lock();
        if rules.is_empty() {
            return false;
        }

        let Some(pos) = rules.iter().position(|rule| {
            rule.kind == kind
                && match rule.target {
                    FaultTarget::Fragment(k) => k == index,
                    FaultTarget::NextFragments(n) => n > 0,
                    FaultTarget::All => true,
                }
        }) else {
            return false;
        };

        let exhausted = match &mut rules[pos].target {
            FaultTarget::Fragment(_) => true,
            FaultTarget::NextFragments(n) => {
                *n -= 1;
                *n == 0
            }
            FaultTarget::All => false,
        };
        if exhausted {
            rules.remove(pos);
        }
        true
    }
}
