//! Resource list arena laid out for a shared memory region.
//!
//! The region may be mapped at a different address in every process, so list links are
//! byte offsets from the start of [`Region`] and are resolved back into entry slots on use.
//! Offset 0 never addresses an entry (the entry pool does not start the region) and means
//! "end of list".

use std::mem::{offset_of, size_of};

use crate::device::{
    HalCapabilities, InputDevices, OutputCaps, OutputDevices, ResourceId, ResourcePriority,
    RESOURCE_ID_QTY,
};

use super::liveness::Liveness;

/// Number of list entries in the pool.
pub(crate) const ENTRY_QTY: usize = 10;

/// Number of user ids handed out to attached objects.
pub(crate) const USER_QTY: usize = 4;

/// Marks an initialised region; a mapped object without it is rebuilt.
pub(crate) const REGION_MAGIC: u32 = 0x5645_5201;

/// Byte offset of an entry from the region base.
pub(crate) type Offset = u32;

const ENTRIES_BASE: usize = offset_of!(Region, entries);
const ENTRY_SIZE: usize = size_of::<Entry>();

/// One resource request, free when `priority` is the free sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub(crate) struct Entry {
    pub priority: u8,
    pub notified: bool,
    pub user_id: u8,
    pub id_record: u8,
    pub id_playback: u8,
    pub pid: u32,
    pub req_input: u32,
    pub req_output: u32,
    pub offset_next: Offset,
}

impl Entry {
    const FREE: Self = Self {
        priority: ResourcePriority::FREE_RAW,
        notified: false,
        user_id: USER_QTY as u8,
        id_record: ResourceId::INVALID_RAW,
        id_playback: ResourceId::INVALID_RAW,
        pid: 0,
        req_input: InputDevices::NONE.0,
        req_output: OutputDevices::NONE.0,
        offset_next: 0,
    };

    fn is_free(&self) -> bool {
        self.priority >= ResourcePriority::FREE_RAW
    }

    fn wants_input(&self) -> bool {
        self.req_input != InputDevices::NONE.0
    }

    fn wants_output(&self) -> bool {
        self.req_output != OutputDevices::NONE.0
    }

    pub(crate) fn record_id(&self) -> Option<ResourceId> {
        ResourceId::new(self.id_record)
    }

    pub(crate) fn playback_id(&self) -> Option<ResourceId> {
        ResourceId::new(self.id_playback)
    }

    fn holds_resources(&self) -> bool {
        self.record_id().is_some() || self.playback_id().is_some()
    }
}

/// Kind of notification produced by an allocation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NoticeKind {
    Grant,
    Revoke,
}

/// A grant or revoke addressed to the owner of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Notice {
    pub kind: NoticeKind,
    pub pid: u32,
    pub user_id: u8,
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

/// The shared resource state: capabilities, allocation tables, attached users and the
/// priority-ordered request list.
#[derive(Debug, Clone)]
#[repr(C)]
pub(crate) struct Region {
    pub(crate) magic: u32,
    pub capabilities: HalCapabilities,
    record_allocated: [bool; RESOURCE_ID_QTY],
    playback_allocated: [bool; RESOURCE_ID_QTY],
    user_pids: [u32; USER_QTY],
    user_count: u32,
    head: Offset,
    entries: [Entry; ENTRY_QTY],
}

impl Region {
    /// A freshly created region with no users.
    pub(crate) fn new() -> Self {
        Self {
            magic: REGION_MAGIC,
            capabilities: HalCapabilities::default(),
            record_allocated: [false; RESOURCE_ID_QTY],
            playback_allocated: [false; RESOURCE_ID_QTY],
            user_pids: [0; USER_QTY],
            user_count: 0,
            head: 0,
            entries: [Entry::FREE; ENTRY_QTY],
        }
    }

    /// Empties the list and allocation tables and stores fresh capabilities.
    pub(crate) fn init(&mut self, capabilities: HalCapabilities) {
        self.record_allocated = [false; RESOURCE_ID_QTY];
        self.playback_allocated = [false; RESOURCE_ID_QTY];
        self.head = 0;
        self.entries = [Entry::FREE; ENTRY_QTY];
        self.capabilities = capabilities;
    }

    /// Registers `pid` as a user and returns its user id.
    ///
    /// User ids of processes that no longer exist are reclaimed first. The list is
    /// reinitialised when nobody else is attached.
    pub(crate) fn attach(
        &mut self,
        pid: u32,
        capabilities: HalCapabilities,
        probe: &dyn Liveness,
    ) -> Option<u8> {
        for (index, owner) in self.user_pids.iter_mut().enumerate() {
            if *owner != 0 && !probe.is_alive(*owner) {
                tracing::info!(user_id = index, pid = *owner, "removing stale user id");
                *owner = 0;
                self.user_count = self.user_count.saturating_sub(1);
            }
        }
        if self.user_count == 0 {
            tracing::info!("initialize resource list");
            self.init(capabilities);
        }
        let index = self.user_pids.iter().position(|owner| *owner == 0)?;
        self.user_pids[index] = pid;
        self.user_count += 1;
        tracing::info!(user_id = index, pid, users = self.user_count, "user attached");
        u8::try_from(index).ok()
    }

    /// Releases a user id; the last user out resets the list.
    pub(crate) fn detach(&mut self, user_id: u8) {
        if let Some(owner) = self.user_pids.get_mut(usize::from(user_id)) {
            if *owner != 0 {
                *owner = 0;
                self.user_count = self.user_count.saturating_sub(1);
            }
        }
        if self.user_count == 0 {
            let capabilities = self.capabilities;
            self.init(capabilities);
        }
    }

    pub(crate) fn user_count(&self) -> u32 {
        self.user_count
    }

    fn slot(offset: Offset) -> Option<usize> {
        let offset = usize::try_from(offset).ok()?;
        let relative = offset.checked_sub(ENTRIES_BASE)?;
        (relative % ENTRY_SIZE == 0 && relative / ENTRY_SIZE < ENTRY_QTY)
            .then_some(relative / ENTRY_SIZE)
    }

    fn offset_of_slot(slot: usize) -> Offset {
        (ENTRIES_BASE + slot * ENTRY_SIZE) as Offset
    }

    /// True when `offset` is a live entry of the given owner.
    pub(crate) fn owned_by(&self, offset: Offset, pid: u32, user_id: u8) -> bool {
        self.entry(offset)
            .is_some_and(|e| !e.is_free() && e.pid == pid && e.user_id == user_id)
    }

    pub(crate) fn entry(&self, offset: Offset) -> Option<&Entry> {
        Self::slot(offset).map(|slot| &self.entries[slot])
    }

    fn entry_mut(&mut self, offset: Offset) -> Option<&mut Entry> {
        Self::slot(offset).map(move |slot| &mut self.entries[slot])
    }

    /// Offsets of the linked entries, head first.
    pub(crate) fn list(&self) -> Vec<Offset> {
        let mut offsets = Vec::with_capacity(ENTRY_QTY);
        let mut next = self.head;
        while next != 0 && offsets.len() < ENTRY_QTY {
            let Some(entry) = self.entry(next) else {
                tracing::error!(offset = next, "corrupt resource list link");
                break;
            };
            offsets.push(next);
            next = entry.offset_next;
        }
        offsets
    }

    /// Claims a free entry for a request.
    pub(crate) fn alloc(
        &mut self,
        priority: ResourcePriority,
        pid: u32,
        user_id: u8,
        input: InputDevices,
        output: OutputDevices,
    ) -> Option<Offset> {
        let Some(slot) = self.entries.iter().position(Entry::is_free) else {
            tracing::error!("out of resource list entries");
            return None;
        };
        self.entries[slot] = Entry {
            priority: priority as u8,
            pid,
            user_id,
            req_input: input.0,
            req_output: output.0,
            ..Entry::FREE
        };
        Some(Self::offset_of_slot(slot))
    }

    /// Updates the request fields of an entry that is about to be re-inserted.
    pub(crate) fn set_request(
        &mut self,
        offset: Offset,
        priority: ResourcePriority,
        input: InputDevices,
        output: OutputDevices,
    ) {
        if let Some(entry) = self.entry_mut(offset) {
            entry.priority = priority as u8;
            entry.req_input = input.0;
            entry.req_output = output.0;
        }
    }

    /// Links an entry after every entry of greater or equal priority.
    pub(crate) fn insert(&mut self, offset: Offset) {
        let Some(priority) = self.entry(offset).map(|e| e.priority) else {
            return;
        };
        let mut previous = None;
        for current in self.list() {
            match self.entry(current) {
                Some(entry) if entry.priority >= priority => previous = Some(current),
                _ => break,
            }
        }
        match previous {
            None => {
                let head = self.head;
                if let Some(entry) = self.entry_mut(offset) {
                    entry.offset_next = head;
                }
                self.head = offset;
            }
            Some(previous) => {
                let next = self.entry(previous).map_or(0, |e| e.offset_next);
                if let Some(entry) = self.entry_mut(offset) {
                    entry.offset_next = next;
                }
                if let Some(entry) = self.entry_mut(previous) {
                    entry.offset_next = offset;
                }
            }
        }
    }

    /// Unlinks an entry, leaving its contents in place.
    pub(crate) fn remove(&mut self, offset: Offset) {
        let next = self.entry(offset).map_or(0, |e| e.offset_next);
        if self.head == offset {
            self.head = next;
        } else if let Some(previous) = self
            .list()
            .into_iter()
            .find(|p| self.entry(*p).is_some_and(|e| e.offset_next == offset))
        {
            if let Some(entry) = self.entry_mut(previous) {
                entry.offset_next = next;
            }
        } else {
            tracing::error!(offset, "entry not found in resource list");
        }
        if let Some(entry) = self.entry_mut(offset) {
            entry.offset_next = 0;
        }
    }

    /// Returns an unlinked entry to the pool together with its resource ids.
    pub(crate) fn free(&mut self, offset: Offset) {
        let Some(entry) = self.entry(offset).copied() else {
            return;
        };
        if let Some(id) = entry.record_id() {
            self.record_allocated[id.index()] = false;
        }
        if let Some(id) = entry.playback_id() {
            self.playback_allocated[id.index()] = false;
        }
        if let Some(entry) = self.entry_mut(offset) {
            *entry = Entry::FREE;
        }
    }

    /// Clears the `notified` flag once the owner has taken delivery of a grant.
    pub(crate) fn acknowledge(&mut self, offset: Offset) -> Option<Entry> {
        let entry = self.entry_mut(offset)?;
        entry.notified = false;
        Some(*entry)
    }

    /// Unlinks and frees every entry owned by a process that no longer exists.
    pub(crate) fn scrub(&mut self, probe: &dyn Liveness) -> usize {
        let stale: Vec<Offset> = self
            .list()
            .into_iter()
            .filter(|offset| {
                self.entry(*offset)
                    .is_some_and(|e| e.pid > 0 && !probe.is_alive(e.pid))
            })
            .collect();
        for offset in &stale {
            if let Some(entry) = self.entry(*offset) {
                tracing::info!(pid = entry.pid, user_id = entry.user_id, "removed stale resource entry");
            }
            self.remove(*offset);
            self.free(*offset);
        }
        stale.len()
    }

    fn allocate_record(&mut self) -> Option<ResourceId> {
        let index = self.record_allocated.iter().position(|used| !used)?;
        self.record_allocated[index] = true;
        ResourceId::new(index as u8)
    }

    /// Output ids are handed out from the highest down so id 0 is the last resort.
    fn allocate_playback(&mut self, output: OutputDevices) -> Option<ResourceId> {
        let wanted = match output {
            OutputDevices::HFP => OutputCaps::OFFLOAD,
            OutputDevices::NORMAL => OutputCaps::DIRECT_PCM,
            _ => return None,
        };
        for index in (0..RESOURCE_ID_QTY).rev() {
            if self.playback_allocated[index]
                || !OutputCaps(self.capabilities.output_caps[index]).contains(wanted)
            {
                continue;
            }
            self.playback_allocated[index] = true;
            tracing::info!(?output, id = index, "playback resource allocated");
            return ResourceId::new(index as u8);
        }
        None
    }

    /// Allocation pass.
    ///
    /// Entries behind the head that hold more than the remaining capacity are revoked. While
    /// any revoke is outstanding nothing is granted; otherwise waiting entries are granted in
    /// list order as capacity allows. Each entry is notified at most once per change.
    pub(crate) fn update(&mut self) -> Vec<Notice> {
        let list = self.list();
        let Some((&head, rest)) = list.split_first() else {
            return Vec::new();
        };
        let input_qty = self.capabilities.input_qty;
        let output_qty = self.capabilities.output_qty;
        let mut notices = Vec::new();

        let (mut record_cnt, mut playback_cnt) = match self.entry(head) {
            Some(entry) => (u8::from(entry.wants_input()), u8::from(entry.wants_output())),
            None => return notices,
        };
        let mut revoked = false;
        for &offset in rest {
            let Some(entry) = self.entry_mut(offset) else {
                continue;
            };
            let mut over = false;
            if entry.record_id().is_some() {
                if record_cnt < input_qty {
                    record_cnt += 1;
                } else {
                    over = true;
                }
            }
            if !over && entry.playback_id().is_some() {
                if playback_cnt < output_qty {
                    playback_cnt += 1;
                } else {
                    over = true;
                }
            }
            if over {
                revoked = true;
                if entry.notified {
                    tracing::debug!(user_id = entry.user_id, "revoke already notified");
                } else {
                    entry.notified = true;
                    notices.push(Notice {
                        kind: NoticeKind::Revoke,
                        pid: entry.pid,
                        user_id: entry.user_id,
                    });
                }
            }
        }
        if revoked {
            tracing::debug!("waiting for revoked resources to be released");
            return notices;
        }

        let (mut record_cnt, mut playback_cnt) = (0u8, 0u8);
        for offset in list {
            let Some(entry) = self.entry(offset).copied() else {
                continue;
            };
            if entry.holds_resources() {
                record_cnt += u8::from(entry.record_id().is_some());
                playback_cnt += u8::from(entry.playback_id().is_some());
                continue;
            }
            let record_fits = !entry.wants_input() || record_cnt < input_qty;
            let playback_fits = !entry.wants_output() || playback_cnt < output_qty;
            if !(entry.wants_input() || entry.wants_output()) || !record_fits || !playback_fits {
                continue;
            }
            if !entry.notified {
                let id_record = if entry.wants_input() {
                    self.allocate_record()
                } else {
                    None
                };
                let id_playback = if entry.wants_output() {
                    self.allocate_playback(OutputDevices(entry.req_output))
                } else {
                    None
                };
                if let Some(slot) = self.entry_mut(offset) {
                    slot.notified = true;
                    slot.id_record = id_record.map_or(ResourceId::INVALID_RAW, ResourceId::get);
                    slot.id_playback =
                        id_playback.map_or(ResourceId::INVALID_RAW, ResourceId::get);
                }
                notices.push(Notice {
                    kind: NoticeKind::Grant,
                    pid: entry.pid,
                    user_id: entry.user_id,
                });
            }
            record_cnt += u8::from(entry.wants_input());
            playback_cnt += u8::from(entry.wants_output());
        }
        notices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::liveness::tests::FakeLiveness;
    use crate::device::InputCaps;

    fn caps(input_qty: u8, output_qty: u8) -> HalCapabilities {
        HalCapabilities {
            input_qty,
            output_qty,
            input_caps: [InputCaps::LOCAL.0; RESOURCE_ID_QTY],
            output_caps: [OutputCaps::DIRECT_PCM.0; RESOURCE_ID_QTY],
        }
    }

    fn region(input_qty: u8, output_qty: u8) -> Region {
        let mut region = Region::new();
        region.init(caps(input_qty, output_qty));
        region
    }

    fn request(region: &mut Region, priority: ResourcePriority, pid: u32, user_id: u8) -> Offset {
        let offset = region
            .alloc(priority, pid, user_id, InputDevices::SINGLE, OutputDevices::NONE)
            .unwrap();
        region.insert(offset);
        offset
    }

    fn priorities(region: &Region) -> Vec<(u8, u8)> {
        region
            .list()
            .into_iter()
            .map(|o| {
                let e = region.entry(o).unwrap();
                (e.priority, e.user_id)
            })
            .collect()
    }

    #[test]
    fn test_offsets_never_zero() {
        assert!(ENTRIES_BASE > 0);
        assert_eq!(Region::slot(0), None);
        assert_eq!(Region::slot(Region::offset_of_slot(3)), Some(3));
        assert_eq!(Region::slot(Region::offset_of_slot(3) + 1), None);
        assert_eq!(Region::slot(Region::offset_of_slot(ENTRY_QTY)), None);
    }

    #[test]
    fn test_insert_orders_by_priority_then_arrival() {
        let mut region = region(1, 1);
        request(&mut region, ResourcePriority::Low, 1, 0);
        request(&mut region, ResourcePriority::High, 1, 1);
        request(&mut region, ResourcePriority::Medium, 1, 2);
        request(&mut region, ResourcePriority::High, 1, 3);
        assert_eq!(priorities(&region), vec![(2, 1), (2, 3), (1, 2), (0, 0)]);
    }

    #[test]
    fn test_remove_relinks_neighbours() {
        let mut region = region(1, 1);
        let a = request(&mut region, ResourcePriority::High, 1, 0);
        let b = request(&mut region, ResourcePriority::Medium, 1, 1);
        request(&mut region, ResourcePriority::Low, 1, 2);
        region.remove(b);
        assert_eq!(priorities(&region), vec![(2, 0), (0, 2)]);
        region.remove(a);
        assert_eq!(priorities(&region), vec![(0, 2)]);
    }

    #[test]
    fn test_pool_exhaustion() {
        let mut region = region(1, 1);
        for user in 0..ENTRY_QTY {
            request(&mut region, ResourcePriority::Low, 1, user as u8);
        }
        assert!(region
            .alloc(ResourcePriority::High, 1, 0, InputDevices::SINGLE, OutputDevices::NONE)
            .is_none());
    }

    #[test]
    fn test_grant_in_priority_order() {
        let mut region = region(1, 1);
        request(&mut region, ResourcePriority::Low, 1, 0);
        request(&mut region, ResourcePriority::High, 1, 1);
        let notices = region.update();
        assert_eq!(
            notices,
            vec![Notice { kind: NoticeKind::Grant, pid: 1, user_id: 1 }]
        );
        // Nothing is repeated while the grant is pending.
        assert!(region.update().is_empty());
    }

    #[test]
    fn test_higher_priority_revokes_holder() {
        let mut region = region(1, 1);
        let low = request(&mut region, ResourcePriority::Low, 1, 0);
        region.update();
        region.acknowledge(low);
        assert_eq!(region.entry(low).unwrap().record_id(), ResourceId::new(0));

        let high = request(&mut region, ResourcePriority::High, 2, 1);
        let notices = region.update();
        assert_eq!(
            notices,
            vec![Notice { kind: NoticeKind::Revoke, pid: 1, user_id: 0 }]
        );
        // Still waiting for the release: no grant and no repeated revoke.
        assert!(region.update().is_empty());

        region.remove(low);
        region.free(low);
        let notices = region.update();
        assert_eq!(
            notices,
            vec![Notice { kind: NoticeKind::Grant, pid: 2, user_id: 1 }]
        );
        assert_eq!(region.entry(high).unwrap().record_id(), ResourceId::new(0));
    }

    #[test]
    fn test_playback_ids_descend_with_caps_filter() {
        let mut region = Region::new();
        region.init(HalCapabilities {
            input_qty: 0,
            output_qty: 3,
            input_caps: [0; RESOURCE_ID_QTY],
            output_caps: [
                OutputCaps::DIRECT_PCM.0,
                OutputCaps::OFFLOAD.0,
                OutputCaps::DIRECT_PCM.0,
            ],
        });
        assert_eq!(region.allocate_playback(OutputDevices::NORMAL), ResourceId::new(2));
        assert_eq!(region.allocate_playback(OutputDevices::HFP), ResourceId::new(1));
        assert_eq!(region.allocate_playback(OutputDevices::NORMAL), ResourceId::new(0));
        assert_eq!(region.allocate_playback(OutputDevices::NORMAL), None);
    }

    #[test]
    fn test_scrub_frees_dead_owner() {
        let probe = FakeLiveness::alive(&[1]);
        let mut region = region(1, 1);
        let dead = request(&mut region, ResourcePriority::High, 7, 0);
        region.update();
        region.acknowledge(dead);
        request(&mut region, ResourcePriority::Low, 1, 1);

        assert_eq!(region.scrub(&probe), 1);
        assert_eq!(priorities(&region), vec![(0, 1)]);
        let notices = region.update();
        assert_eq!(
            notices,
            vec![Notice { kind: NoticeKind::Grant, pid: 1, user_id: 1 }]
        );
    }

    #[test]
    fn test_user_ids_reclaim_and_reset() {
        let probe = FakeLiveness::alive(&[10, 11]);
        let mut region = Region::new();
        assert_eq!(region.attach(10, caps(1, 1), &probe), Some(0));
        assert_eq!(region.attach(11, caps(1, 1), &probe), Some(1));
        request(&mut region, ResourcePriority::Low, 10, 0);

        probe.kill(11);
        assert_eq!(region.attach(12, caps(1, 1), &probe), Some(1));
        assert_eq!(region.user_count(), 2);
        assert_eq!(region.list().len(), 1);

        region.detach(0);
        region.detach(1);
        assert_eq!(region.user_count(), 0);
        assert!(region.list().is_empty());
    }

    #[test]
    fn test_user_ids_exhausted() {
        let probe = FakeLiveness::alive(&[1]);
        let mut region = Region::new();
        for expected in 0..USER_QTY as u8 {
            assert_eq!(region.attach(1, caps(1, 1), &probe), Some(expected));
        }
        assert_eq!(region.attach(1, caps(1, 1), &probe), None);
    }
}
