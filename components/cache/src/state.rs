//! Object lifecycle states and events
//!
//! Every cache object runs this state machine. Wait states park the object
//! until an event in their wait mask arrives; work states do a bounded piece
//! of work and transition. Two events are out-of-band and are serviced from
//! any live state before the state's own work: `KILL` and `ERROR`.
//!
//! ## Wakeups are hints
//!
//! A wait state woken by an event always re-enters a work state that
//! re-checks the real condition (operation counts, child counts) and may
//! park again. Stale `CLEARED` bits left over from an earlier phase are
//! therefore harmless: they cost one extra pass, never a wrong transition.

use bitflags::bitflags;
use static_assertions::{const_assert, const_assert_eq};

bitflags! {
    /// Events that can be raised on a cache object from any thread
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ObjectEvents: u32 {
        /// A new object wants to boot (birth command)
        const NEW_CHILD = 1 << 0;
        /// The parent object has become available
        const PARENT_READY = 1 << 1;
        /// Push attribute changes to the backend
        const UPDATE = 1 << 2;
        /// Discard the cached data and start afresh
        const INVALIDATE = 1 << 3;
        /// A blocking count (operations, children) may have dropped to zero
        const CLEARED = 1 << 4;
        /// Something went irrecoverably wrong
        const ERROR = 1 << 5;
        /// Tear the object down
        const KILL = 1 << 6;
    }
}

/// Events serviced from any live state, ahead of the state's own work
pub const OOB_EVENTS: ObjectEvents = ObjectEvents::ERROR.union(ObjectEvents::KILL);

const_assert!(OOB_EVENTS.bits() != 0);
const_assert_eq!(core::mem::size_of::<ObjectState>(), 1);

/// The per-object lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Birth state; waiting for `NEW_CHILD`
    WaitForInit,
    /// Queued on the parent's dependents list; waiting for `PARENT_READY`
    WaitForParent,
    /// Asking the backend whether the object already exists
    LookUpObject,
    /// Lookup was negative; creating the object in the backend
    CreateObject,
    /// Lookup/creation succeeded; opening for business
    Available,
    /// Waking every dependent that was waiting on us
    JumpstartDeps,
    /// Steady state; waiting for `UPDATE` or `INVALIDATE`
    WaitForCmd,
    /// Pushing attribute changes to the backend
    UpdateObject,
    /// Discarding cached data; may have to wait for operations to drain
    InvalidateObject,
    /// Invalidation waiting for in-flight operations; waiting for `CLEARED`
    WaitForClearance,
    /// Lookup or creation failed; heading for teardown
    LookupFailure,
    /// Cancelling operations and killing dependents
    KillObject,
    /// Sweeping up late dependents, then checking for live children
    KillDependents,
    /// Teardown waiting for children to detach; waiting for `CLEARED`
    WaitForChildren,
    /// Detaching from the parent and dropping backend state
    DropObject,
    /// Terminal state
    Dead,
}

impl ObjectState {
    /// Whether this state parks until an event arrives
    pub fn is_wait(self) -> bool {
        matches!(
            self,
            ObjectState::WaitForInit
                | ObjectState::WaitForParent
                | ObjectState::WaitForCmd
                | ObjectState::WaitForClearance
                | ObjectState::WaitForChildren
        )
    }

    /// The events a wait state responds to (empty for work states)
    pub fn wait_mask(self) -> ObjectEvents {
        match self {
            ObjectState::WaitForInit => ObjectEvents::NEW_CHILD,
            ObjectState::WaitForParent => ObjectEvents::PARENT_READY,
            ObjectState::WaitForCmd => ObjectEvents::UPDATE | ObjectEvents::INVALIDATE,
            ObjectState::WaitForClearance | ObjectState::WaitForChildren => ObjectEvents::CLEARED,
            _ => ObjectEvents::empty(),
        }
    }

    /// Whether the machine has entered the teardown path
    pub fn is_dying(self) -> bool {
        matches!(
            self,
            ObjectState::LookupFailure
                | ObjectState::KillObject
                | ObjectState::KillDependents
                | ObjectState::WaitForChildren
                | ObjectState::DropObject
                | ObjectState::Dead
        )
    }

    /// Whether this is the terminal state
    pub fn is_terminal(self) -> bool {
        self == ObjectState::Dead
    }

    /// Short name for logging
    pub fn name(self) -> &'static str {
        match self {
            ObjectState::WaitForInit => "WAIT_FOR_INIT",
            ObjectState::WaitForParent => "WAIT_FOR_PARENT",
            ObjectState::LookUpObject => "LOOK_UP_OBJECT",
            ObjectState::CreateObject => "CREATE_OBJECT",
            ObjectState::Available => "AVAILABLE",
            ObjectState::JumpstartDeps => "JUMPSTART_DEPS",
            ObjectState::WaitForCmd => "WAIT_FOR_CMD",
            ObjectState::UpdateObject => "UPDATE_OBJECT",
            ObjectState::InvalidateObject => "INVALIDATE_OBJECT",
            ObjectState::WaitForClearance => "WAIT_FOR_CLEARANCE",
            ObjectState::LookupFailure => "LOOKUP_FAILURE",
            ObjectState::KillObject => "KILL_OBJECT",
            ObjectState::KillDependents => "KILL_DEPENDENTS",
            ObjectState::WaitForChildren => "WAIT_FOR_CHILDREN",
            ObjectState::DropObject => "DROP_OBJECT",
            ObjectState::Dead => "DEAD",
        }
    }
}

impl core::fmt::Display for ObjectState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_states_have_masks_work_states_do_not() {
        let all = [
            ObjectState::WaitForInit,
            ObjectState::WaitForParent,
            ObjectState::LookUpObject,
            ObjectState::CreateObject,
            ObjectState::Available,
            ObjectState::JumpstartDeps,
            ObjectState::WaitForCmd,
            ObjectState::UpdateObject,
            ObjectState::InvalidateObject,
            ObjectState::WaitForClearance,
            ObjectState::LookupFailure,
            ObjectState::KillObject,
            ObjectState::KillDependents,
            ObjectState::WaitForChildren,
            ObjectState::DropObject,
            ObjectState::Dead,
        ];

        for state in all {
            assert_eq!(
                state.is_wait(),
                !state.wait_mask().is_empty(),
                "mask/wait mismatch for {state}"
            );
        }
    }

    #[test]
    fn oob_events_never_overlap_wait_masks() {
        // KILL and ERROR are always serviced out of band; no wait state may
        // claim them for itself.
        for state in [
            ObjectState::WaitForInit,
            ObjectState::WaitForParent,
            ObjectState::WaitForCmd,
            ObjectState::WaitForClearance,
            ObjectState::WaitForChildren,
        ] {
            assert!(state.wait_mask().intersection(OOB_EVENTS).is_empty());
        }
    }

    #[test]
    fn teardown_states_are_dying() {
        assert!(ObjectState::KillObject.is_dying());
        assert!(ObjectState::Dead.is_dying());
        assert!(ObjectState::Dead.is_terminal());
        assert!(!ObjectState::WaitForCmd.is_dying());
        assert!(!ObjectState::InvalidateObject.is_dying());
    }
}
