//! Lifecycle transition rules for instances.
//!
//! The legal edges over (status, role) pairs:
//!
//! ```text
//! Launching ──────────► Running ────────► Terminating ──► Terminated
//!     │                  │    │                ▲
//!     └──► Terminating   │    └──► Zombie ─────┘
//!                        │              ▲
//!          (replica) Promoting ─────────┘
//!                        │
//!                        └──► Running+Primary   (promotion, atomic with
//!                                                demoting the old primary)
//! ```
//!
//! A row whose status or role is `Zombie` can never move to
//! `Running` + `Primary` again.

use crate::types::{InstanceRole, LifecycleStatus};

/// A (status, role) pair describing one side of a transition.
pub type StatePair = (LifecycleStatus, InstanceRole);

/// Whether the lifecycle edge `from -> to` is legal.
pub fn transition_allowed(from: StatePair, to: StatePair) -> bool {
    use InstanceRole::*;
    use LifecycleStatus::*;

    // Core invariant: a zombie never re-acquires the primary role.
    if (from.0 == LifecycleStatus::Zombie || from.1 == InstanceRole::Zombie)
        && to == (Running, Primary)
    {
        return false;
    }

    match (from, to) {
        ((Launching, r1), (Running, r2)) => r1 == r2,
        ((Launching, r1), (Terminating, r2)) => r1 == r2,
        ((Running, Replica), (Promoting, Replica)) => true,
        // Promotion completes; used by the atomic promote transaction.
        ((Promoting, Replica), (Running, Primary)) => true,
        ((Running, _), (LifecycleStatus::Zombie, InstanceRole::Zombie)) => true,
        ((Promoting, Replica), (LifecycleStatus::Zombie, InstanceRole::Zombie)) => true,
        (
            (LifecycleStatus::Zombie, InstanceRole::Zombie),
            (Terminating, InstanceRole::Zombie),
        ) => true,
        ((Running, r1), (Terminating, r2)) => r1 == r2,
        ((Terminating, r1), (Terminated, r2)) => r1 == r2,
        _ => false,
    }
}

/// Render a state pair for error messages.
pub fn describe(pair: StatePair) -> String {
    format!("{:?}+{:?}", pair.0, pair.1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use InstanceRole::*;
    use LifecycleStatus::*;

    #[test]
    fn launch_to_running_keeps_role() {
        assert!(transition_allowed((Launching, Primary), (Running, Primary)));
        assert!(transition_allowed((Launching, Replica), (Running, Replica)));
        assert!(!transition_allowed((Launching, Replica), (Running, Primary)));
    }

    #[test]
    fn promotion_chain_is_legal() {
        assert!(transition_allowed((Running, Replica), (Promoting, Replica)));
        assert!(transition_allowed((Promoting, Replica), (Running, Primary)));
    }

    #[test]
    fn zombie_never_returns_to_primary() {
        assert!(!transition_allowed(
            (LifecycleStatus::Zombie, InstanceRole::Zombie),
            (Running, Primary)
        ));
        assert!(!transition_allowed(
            (Running, InstanceRole::Zombie),
            (Running, Primary)
        ));
        // Only termination is left for a zombie.
        assert!(transition_allowed(
            (LifecycleStatus::Zombie, InstanceRole::Zombie),
            (Terminating, InstanceRole::Zombie)
        ));
    }

    #[test]
    fn terminated_is_terminal() {
        for status in [
            Launching,
            Running,
            Promoting,
            LifecycleStatus::Zombie,
            Terminating,
        ] {
            for role in [Primary, Replica, InstanceRole::Zombie] {
                assert!(!transition_allowed(
                    (Terminated, InstanceRole::Zombie),
                    (status, role)
                ));
            }
        }
    }

    #[test]
    fn demotion_from_running_or_promoting() {
        assert!(transition_allowed(
            (Running, Primary),
            (LifecycleStatus::Zombie, InstanceRole::Zombie)
        ));
        assert!(transition_allowed(
            (Running, Replica),
            (LifecycleStatus::Zombie, InstanceRole::Zombie)
        ));
        assert!(transition_allowed(
            (Promoting, Replica),
            (LifecycleStatus::Zombie, InstanceRole::Zombie)
        ));
    }

    #[test]
    fn promoting_a_terminated_instance_is_rejected() {
        assert!(!transition_allowed((Terminated, Replica), (Running, Primary)));
        assert!(!transition_allowed((Terminating, Replica), (Promoting, Replica)));
    }
}
