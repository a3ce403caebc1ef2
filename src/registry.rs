//! Voice session ownership.
//!
//! At most one source may own a voice session per session group. A keyword detection takes
//! the default group for the local microphone; stopping the record/stream that followed it
//! releases the group again. The registry is created once per process and shared by every
//! object that records, so two objects cannot both start a voice session at once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use crate::device::InputDevices;

/// Session groups tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionGroup {
    /// Regular voice sessions.
    Default,
    /// Microphone tap sessions running alongside the default one.
    MicTap,
}

impl SessionGroup {
    /// Number of groups.
    pub const QTY: usize = 2;

    /// Group serving `source`.
    #[must_use]
    pub fn for_source(source: InputDevices) -> Self {
        if source == InputDevices::MIC_TAP {
            Self::MicTap
        } else {
            Self::Default
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Default => 0,
            Self::MicTap => 1,
        }
    }
}

/// Process-wide table of which source owns each voice session group.
///
/// Clones share the same table.
///
/// ```
/// use voice_engine::{InputDevices, SessionGroup, VoiceSessionRegistry};
///
/// let registry = VoiceSessionRegistry::new();
/// assert!(registry.lock(InputDevices::SINGLE));
/// assert!(!registry.lock(InputDevices::SINGLE));
/// assert_eq!(registry.owner(SessionGroup::Default), InputDevices::SINGLE);
/// registry.unlock(InputDevices::SINGLE);
/// assert!(registry.owner(SessionGroup::Default).is_none());
/// ```
#[derive(Debug, Clone, Default)]
pub struct VoiceSessionRegistry {
    owners: Arc<[AtomicU32; SessionGroup::QTY]>,
}

impl VoiceSessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry shared by objects that are not given one explicitly.
    pub fn global() -> Self {
        static GLOBAL: OnceLock<VoiceSessionRegistry> = OnceLock::new();
        GLOBAL.get_or_init(VoiceSessionRegistry::new).clone()
    }

    /// Claims the group of `source`; fails while another session holds it.
    pub fn lock(&self, source: InputDevices) -> bool {
        let group = SessionGroup::for_source(source);
        let slot = &self.owners[group.index()];
        match slot.compare_exchange(
            InputDevices::NONE.0,
            source.0,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                tracing::info!(?group, source = source.0, "voice session locked");
                true
            }
            Err(owner) => {
                tracing::error!(?group, source = source.0, owner, "voice session denied, existing session in progress");
                false
            }
        }
    }

    /// Releases the group of `source`.
    pub fn unlock(&self, source: InputDevices) {
        let group = SessionGroup::for_source(source);
        self.owners[group.index()].store(InputDevices::NONE.0, Ordering::Release);
        tracing::info!(?group, "voice session unlocked");
    }

    /// Current owner of `group` (`NONE` when free).
    pub fn owner(&self, group: SessionGroup) -> InputDevices {
        InputDevices(self.owners[group.index()].load(Ordering::Acquire))
    }
}
