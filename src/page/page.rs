use std::cmp::Ordering;

use crate::common::{
    EngineError, PageId, PageNo, Result, SpaceId, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};
use crate::record::{
    codec, compare_with_key, decode_offsets, encode, encoded_size, header::field, FieldValue,
    RecordHeader, RecordStatus,
};

use super::layout::{
    self, dir, fil, header as ph, Direction, PageType, HEAP_START, INFIMUM_DATA, INFIMUM_ORIGIN,
    SUPREMUM_DATA, SUPREMUM_ORIGIN,
};

/// Lower bound on the owned-count of an interior directory slot.
pub const DIR_SLOT_MIN_OWNED: u8 = 4;

/// Upper bound on the owned-count of any directory slot.
pub const DIR_SLOT_MAX_OWNED: u8 = 8;

/// Result of a key search within a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PagePosition {
    /// Origin of the last record strictly less than the key.
    pub prev: usize,
    /// Origin of the first record >= the key (supremum if none).
    pub next: usize,
    /// Whether `next` compares equal to the key (leftmost match).
    pub matched: bool,
    /// Directory slot whose chain segment the search descended into.
    pub slot: usize,
}

/// RecordPage interprets a page image as a record heap with an ordered
/// chain and a sparse directory, and maintains every in-page invariant
/// across mutations.
///
/// The view borrows the frame bytes exclusively; concurrency is the
/// caller's business (per-page latch, exclusive for the mutating methods).
pub struct RecordPage<'a> {
    data: &'a mut [u8],
    desc: &'a crate::record::RecordDescriptor,
}

impl<'a> RecordPage<'a> {
    /// Creates a view over the given page image. Pages are managed in the
    /// compact record format; original-format records exist only at the
    /// codec level for reading foreign images.
    pub fn new(data: &'a mut [u8], desc: &'a crate::record::RecordDescriptor) -> Self {
        let len = data.len();
        assert!(
            len.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&len),
            "page image must be a power of two in [{}, {}]",
            MIN_PAGE_SIZE,
            MAX_PAGE_SIZE
        );
        assert_eq!(
            desc.format(),
            crate::record::RecordFormat::Compact,
            "record pages are managed in the compact format"
        );
        Self { data, desc }
    }

    /// Initializes a fresh record page: header fields, the two sentinel
    /// records, and a two-slot directory.
    pub fn init(&mut self, space: SpaceId, page_no: PageNo) {
        self.data.fill(0);
        fil::set_space_id(self.data, space);
        fil::set_page_no(self.data, page_no);
        fil::set_prev(self.data, None);
        fil::set_next(self.data, None);
        fil::set_page_type(self.data, PageType::Record);

        ph::set_n_dir_slots(self.data, 2);
        ph::set_heap_top(self.data, HEAP_START as u16);
        ph::set_n_heap(self.data, 2);
        ph::set_free(self.data, 0);
        ph::set_garbage(self.data, 0);
        ph::set_last_insert(self.data, 0);
        ph::set_direction(self.data, Direction::None);
        ph::set_n_direction(self.data, 0);
        ph::set_n_recs(self.data, 0);
        ph::set_max_trx_id(self.data, 0);

        // Infimum: chain start, owns itself.
        let mut inf = RecordHeader::new(RecordStatus::Infimum, 0);
        inf.owned = 1;
        inf.next = rel(INFIMUM_ORIGIN, SUPREMUM_ORIGIN);
        inf.write(self.data, INFIMUM_ORIGIN);
        self.data[INFIMUM_ORIGIN..INFIMUM_ORIGIN + 8].copy_from_slice(INFIMUM_DATA);

        // Supremum: chain end, initially owns only itself.
        let mut sup = RecordHeader::new(RecordStatus::Supremum, 1);
        sup.owned = 1;
        sup.next = 0;
        sup.write(self.data, SUPREMUM_ORIGIN);
        self.data[SUPREMUM_ORIGIN..SUPREMUM_ORIGIN + 8].copy_from_slice(SUPREMUM_DATA);

        dir::set_slot(self.data, 0, INFIMUM_ORIGIN as u16);
        dir::set_slot(self.data, 1, SUPREMUM_ORIGIN as u16);
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(fil::space_id(self.data), fil::page_no(self.data))
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn record_count(&self) -> u16 {
        ph::n_recs(self.data)
    }

    pub fn dir_slot_count(&self) -> u16 {
        ph::n_dir_slots(self.data)
    }

    pub fn garbage_bytes(&self) -> u16 {
        ph::garbage(self.data)
    }

    pub fn heap_top(&self) -> u16 {
        ph::heap_top(self.data)
    }

    /// Contiguous free bytes between the heap top and the directory.
    pub fn free_space(&self) -> usize {
        let n = ph::n_dir_slots(self.data) as usize;
        dir::low_water(self.data.len(), n).saturating_sub(ph::heap_top(self.data) as usize)
    }

    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Origins of the deleted records currently on the free list.
    pub fn free_list(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut at = ph::free(self.data) as usize;
        while at != 0 {
            out.push(at);
            at = match RecordHeader::read(self.data, at) {
                Ok(h) => h.next_origin(at).unwrap_or(0),
                Err(_) => 0,
            };
        }
        out
    }

    /// Binary-searches the directory for the slot whose chain segment may
    /// contain the key: the greatest slot whose anchor compares less.
    pub fn locate_slot(&self, key: &[FieldValue]) -> Result<usize> {
        let n = ph::n_dir_slots(self.data) as usize;
        let mut lo = 0usize; // infimum, always less than any key
        let mut hi = n - 1; // supremum, always greater
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            let anchor = dir::slot(self.data, mid) as usize;
            match self.compare_record(anchor, key)? {
                Ordering::Less => lo = mid,
                // Equal anchors are approached from below so the scan
                // lands on the leftmost match.
                _ => hi = mid,
            }
        }
        Ok(lo)
    }

    /// Full search: directory binary search, then a linear walk of the
    /// owned chain segment.
    pub fn locate(&self, key: &[FieldValue]) -> Result<PagePosition> {
        let slot = self.locate_slot(key)?;
        let mut prev = dir::slot(self.data, slot) as usize;
        loop {
            let next = self
                .next_of(prev)?
                .ok_or_else(|| self.corrupt("record chain ended before supremum"))?;
            match self.compare_record(next, key)? {
                Ordering::Less => prev = next,
                Ordering::Equal => {
                    return Ok(PagePosition {
                        prev,
                        next,
                        matched: true,
                        slot,
                    })
                }
                Ordering::Greater => {
                    return Ok(PagePosition {
                        prev,
                        next,
                        matched: false,
                        slot,
                    })
                }
            }
        }
    }

    /// Looks up a record by key. Returns its origin when present.
    pub fn search(&self, key: &[FieldValue]) -> Result<Option<usize>> {
        let pos = self.locate(key)?;
        Ok(pos.matched.then_some(pos.next))
    }

    /// Decodes all fields of the record at `origin`.
    pub fn record_fields(&self, origin: usize) -> Result<Vec<Option<Vec<u8>>>> {
        codec::decode_fields(self.data, origin, self.desc)
    }

    /// Inserts a record built from `fields`, keeping the chain ordered by
    /// the key-member fields. Returns the record's heap ordinal.
    ///
    /// `PageFull` is a signaled return, not corruption; the caller splits
    /// or relocates.
    pub fn insert(&mut self, fields: &[FieldValue], status: RecordStatus) -> Result<u16> {
        debug_assert!(matches!(
            status,
            RecordStatus::Ordinary | RecordStatus::NodePointer
        ));
        let size = encoded_size(self.desc, fields, status)?;
        let key = self.key_of(fields, status);

        let mut pos = self.locate(&key)?;
        let (alloc_start, heap_no, reorganized) = self.allocate(size.total())?;
        if reorganized {
            pos = self.locate(&key)?;
        }

        let origin = encode(self.data, alloc_start, self.desc, fields, status, heap_no)?;

        // Link into the chain between pos.prev and pos.next.
        field::set_next(self.data, origin, rel(origin, pos.next));
        field::set_next(self.data, pos.prev, rel(pos.prev, origin));

        // The new record joins the group anchored at the next slot-owned
        // record at or above it.
        let anchor = self.anchor_of(origin)?;
        let owned = field::owned(self.data, anchor) + 1;
        field::set_owned(self.data, anchor, owned);

        ph::set_n_recs(self.data, ph::n_recs(self.data) + 1);
        self.note_insert_direction(pos.prev, origin);

        if owned > DIR_SLOT_MAX_OWNED {
            let slot = self.slot_index_of(anchor)?;
            self.split_slot(slot)?;
        }

        Ok(heap_no)
    }

    /// Deletes the record matching `key`: unlink, free-list prepend,
    /// garbage accounting, and directory balancing.
    pub fn delete(&mut self, key: &[FieldValue]) -> Result<()> {
        let pos = self.locate(key)?;
        if !pos.matched {
            return Err(EngineError::RecordNotFound);
        }
        let target = pos.next;
        let prev = pos.prev;

        let offsets = decode_offsets(self.data, target, self.desc)?;
        let span = offsets.total_size();

        let after = self
            .next_of(target)?
            .ok_or_else(|| self.corrupt("deleting a record with no successor"))?;

        // Unlink from the chain.
        field::set_next(self.data, prev, rel(prev, after));

        // Directory bookkeeping.
        let anchor = self.anchor_of_inclusive(target)?;
        let slot = self.slot_index_of(anchor)?;
        let mut balance_slot = None;
        if anchor == target {
            let k = field::owned(self.data, target);
            if k == 1 {
                // The group contained only the deleted record.
                self.remove_slot(slot);
            } else {
                dir::set_slot(self.data, slot, prev as u16);
                field::set_owned(self.data, prev, k - 1);
                if k - 1 < DIR_SLOT_MIN_OWNED {
                    balance_slot = Some(slot);
                }
            }
        } else {
            let k = field::owned(self.data, anchor) - 1;
            field::set_owned(self.data, anchor, k);
            if k < DIR_SLOT_MIN_OWNED {
                balance_slot = Some(slot);
            }
        }

        // Prepend to the free list.
        field::set_owned(self.data, target, 0);
        field::set_deleted(self.data, target, true);
        let free_head = ph::free(self.data) as usize;
        let next_rel = if free_head == 0 {
            0
        } else {
            rel(target, free_head)
        };
        field::set_next(self.data, target, next_rel);
        ph::set_free(self.data, target as u16);

        ph::set_garbage(self.data, ph::garbage(self.data) + span as u16);
        ph::set_n_recs(self.data, ph::n_recs(self.data) - 1);
        ph::set_last_insert(self.data, 0);
        ph::set_direction(self.data, Direction::None);
        ph::set_n_direction(self.data, 0);

        if let Some(slot) = balance_slot {
            self.balance_slot(slot)?;
        }
        Ok(())
    }

    /// Rebuilds the heap contiguously, dropping garbage. Heap ordinals are
    /// preserved so external references stay valid; directory slots are
    /// remapped to the moved origins.
    pub fn reorganize(&mut self) -> Result<()> {
        #[allow(clippy::type_complexity)]
        let mut records: Vec<(usize, Vec<u8>, usize)> = Vec::new(); // (old origin, span bytes, extra)
        let mut chain = vec![INFIMUM_ORIGIN];
        let mut cur = INFIMUM_ORIGIN;
        while let Some(next) = self.next_of(cur)? {
            chain.push(next);
            if next != SUPREMUM_ORIGIN {
                let offsets = decode_offsets(self.data, next, self.desc)?;
                let start = next - offsets.extra_size();
                let end = next + offsets.data_size();
                records.push((next, self.data[start..end].to_vec(), offsets.extra_size()));
            }
            cur = next;
        }

        // Lay the surviving records back down from the heap start.
        let old_top = ph::heap_top(self.data) as usize;
        self.data[HEAP_START..old_top].fill(0);

        let mut map = std::collections::HashMap::new();
        map.insert(INFIMUM_ORIGIN, INFIMUM_ORIGIN);
        map.insert(SUPREMUM_ORIGIN, SUPREMUM_ORIGIN);
        let mut top = HEAP_START;
        for (old_origin, bytes, extra) in &records {
            self.data[top..top + bytes.len()].copy_from_slice(bytes);
            map.insert(*old_origin, top + extra);
            top += bytes.len();
        }

        // Rewrite the chain pointers in order.
        for pair in chain.windows(2) {
            let from = map[&pair[0]];
            let to = map[&pair[1]];
            field::set_next(self.data, from, rel(from, to));
        }

        // Remap directory anchors.
        let n = ph::n_dir_slots(self.data) as usize;
        for i in 0..n {
            let old = dir::slot(self.data, i) as usize;
            let new = *map
                .get(&old)
                .ok_or_else(|| self.corrupt("directory slot points outside the chain"))?;
            dir::set_slot(self.data, i, new as u16);
        }

        ph::set_heap_top(self.data, top as u16);
        ph::set_free(self.data, 0);
        ph::set_garbage(self.data, 0);
        ph::set_last_insert(self.data, 0);
        ph::set_direction(self.data, Direction::None);
        ph::set_n_direction(self.data, 0);
        Ok(())
    }

    /// Copies the records in `[from_origin, to_origin]` (chain order) into
    /// `dst`, re-encoding each one. Used by page splits above this layer.
    pub fn copy_chain_to(
        &self,
        dst: &mut RecordPage<'_>,
        from_origin: usize,
        to_origin: usize,
    ) -> Result<()> {
        let mut cur = from_origin;
        loop {
            let offsets = decode_offsets(self.data, cur, self.desc)?;
            let fields = codec::decode_fields(self.data, cur, self.desc)?;
            let views: Vec<FieldValue> = fields.iter().map(|f| f.as_deref()).collect();
            dst.insert(&views, offsets.status())?;
            if cur == to_origin {
                return Ok(());
            }
            cur = self
                .next_of(cur)?
                .ok_or_else(|| self.corrupt("copy range escaped the chain"))?;
        }
    }

    /// Walks the chain and checks every page invariant. Violations are
    /// reported as corruption; this is the fatal path, not a signal.
    pub fn validate(&self) -> Result<()> {
        let n = ph::n_dir_slots(self.data) as usize;
        let n_recs = ph::n_recs(self.data) as usize;
        let page_size = self.data.len();

        if dir::slot(self.data, 0) as usize != INFIMUM_ORIGIN {
            return Err(self.corrupt("directory slot 0 does not point at infimum"));
        }
        if dir::slot(self.data, n - 1) as usize != SUPREMUM_ORIGIN {
            return Err(self.corrupt("last directory slot does not point at supremum"));
        }
        let heap_top = ph::heap_top(self.data) as usize;
        if heap_top > dir::low_water(page_size, n) {
            return Err(self.corrupt("heap overlaps the directory"));
        }

        let anchors: Vec<usize> = (0..n).map(|i| dir::slot(self.data, i) as usize).collect();

        // Chain walk: bounded, ordered, sized, and owned-count accounting.
        let mut cur = INFIMUM_ORIGIN;
        let mut user_seen = 0usize;
        let mut owned_sum = 0usize;
        let mut live_bytes = 0usize;
        let mut prev_user: Option<usize> = None;
        for _ in 0..n_recs + 3 {
            let owned = field::owned(self.data, cur);
            if owned > 0 && !anchors.contains(&cur) {
                return Err(self.corrupt("record owns a group but anchors no slot"));
            }
            owned_sum += owned as usize;
            let status = field::status(self.data, cur)
                .map_err(|_| self.corrupt("record carries an unknown status"))?;
            match status {
                RecordStatus::Infimum => {}
                RecordStatus::Supremum => {
                    if user_seen != n_recs {
                        return Err(self.corrupt("chain record count disagrees with n_recs"));
                    }
                    if owned_sum != n_recs + 2 {
                        return Err(self.corrupt("owned counts do not sum to n_recs + 2"));
                    }
                    let expected = heap_top - HEAP_START;
                    let garbage = ph::garbage(self.data) as usize;
                    if live_bytes + garbage != expected {
                        return Err(self.corrupt("live bytes plus garbage disagree with heap top"));
                    }
                    return self.validate_owned_bounds(&anchors);
                }
                RecordStatus::Ordinary | RecordStatus::NodePointer => {
                    user_seen += 1;
                    let offsets = decode_offsets(self.data, cur, self.desc)
                        .map_err(|e| self.attach_page(e))?;
                    live_bytes += offsets.total_size();
                    if cur + offsets.data_size() > page_size - layout::TRAILER_SIZE {
                        return Err(self.corrupt("record data crosses the trailer"));
                    }
                    if let Some(p) = prev_user {
                        if self.compare_order(p, cur)? == Ordering::Greater {
                            return Err(self.corrupt("record chain is not key-ordered"));
                        }
                    }
                    prev_user = Some(cur);
                }
            }
            cur = match self.next_of(cur)? {
                Some(next) if next >= HEAP_START || next == SUPREMUM_ORIGIN => next,
                Some(_) => return Err(self.corrupt("next pointer escapes the record area")),
                None => return Err(self.corrupt("record chain ended before supremum")),
            };
            if cur >= page_size - layout::TRAILER_SIZE {
                return Err(self.corrupt("next pointer escapes the page"));
            }
        }
        Err(self.corrupt("record chain is cyclic"))
    }

    // ----- internals -------------------------------------------------

    fn validate_owned_bounds(&self, anchors: &[usize]) -> Result<()> {
        let n = anchors.len();
        for (i, &a) in anchors.iter().enumerate() {
            let owned = field::owned(self.data, a);
            let ok = if i == 0 {
                owned == 1
            } else if i == n - 1 {
                (1..=DIR_SLOT_MAX_OWNED).contains(&owned)
            } else {
                (DIR_SLOT_MIN_OWNED..=DIR_SLOT_MAX_OWNED).contains(&owned)
            };
            if !ok {
                return Err(self.corrupt("directory slot owned-count out of bounds"));
            }
        }
        Ok(())
    }

    /// Key view of an insert's field values.
    fn key_of<'f>(
        &self,
        fields: &[FieldValue<'f>],
        status: RecordStatus,
    ) -> Vec<FieldValue<'f>> {
        match status {
            RecordStatus::NodePointer => fields[..self.desc.key_field_count()].to_vec(),
            _ => self
                .desc
                .key_field_indices()
                .into_iter()
                .map(|i| fields[i])
                .collect(),
        }
    }

    fn compare_record(&self, origin: usize, key: &[FieldValue]) -> Result<Ordering> {
        if origin == INFIMUM_ORIGIN {
            return Ok(Ordering::Less);
        }
        if origin == SUPREMUM_ORIGIN {
            return Ok(Ordering::Greater);
        }
        let offsets = decode_offsets(self.data, origin, self.desc)
            .map_err(|e| self.attach_page(e))?;
        Ok(compare_with_key(
            self.data, origin, &offsets, self.desc, key,
        ))
    }

    /// Orders two user records by their key fields.
    fn compare_order(&self, a: usize, b: usize) -> Result<Ordering> {
        let a_offsets = decode_offsets(self.data, a, self.desc)?;
        let key_idx = self.desc.key_field_indices();
        let key: Vec<FieldValue> = key_idx
            .iter()
            .map(|&i| codec::nth_field(self.data, a, &a_offsets, i))
            .collect();
        let b_offsets = decode_offsets(self.data, b, self.desc)?;
        // compare_with_key orders b against a's key; invert for a vs b.
        Ok(
            match compare_with_key(self.data, b, &b_offsets, self.desc, &key) {
                Ordering::Less => Ordering::Greater,
                Ordering::Equal => Ordering::Equal,
                Ordering::Greater => Ordering::Less,
            },
        )
    }

    fn next_of(&self, origin: usize) -> Result<Option<usize>> {
        let next = field::next(self.data, origin);
        if next == 0 {
            return Ok(None);
        }
        let abs = origin as isize + next as isize;
        if abs < 0 || abs as usize >= self.data.len() {
            return Err(self.corrupt("next pointer out of range"));
        }
        Ok(Some(abs as usize))
    }

    /// First slot-anchored record strictly after `origin` in the chain,
    /// or `origin` itself when it is an anchor.
    fn anchor_of_inclusive(&self, origin: usize) -> Result<usize> {
        let mut cur = origin;
        loop {
            if field::owned(self.data, cur) > 0 {
                return Ok(cur);
            }
            cur = self
                .next_of(cur)?
                .ok_or_else(|| self.corrupt("chain has no owning anchor"))?;
        }
    }

    /// Owning anchor of a freshly linked record (never the record itself).
    fn anchor_of(&self, origin: usize) -> Result<usize> {
        let next = self
            .next_of(origin)?
            .ok_or_else(|| self.corrupt("new record has no successor"))?;
        self.anchor_of_inclusive(next)
    }

    fn slot_index_of(&self, anchor: usize) -> Result<usize> {
        let n = ph::n_dir_slots(self.data) as usize;
        (0..n)
            .find(|&i| dir::slot(self.data, i) as usize == anchor)
            .ok_or_else(|| self.corrupt("anchor record missing from the directory"))
    }

    /// Space allocation for `need` bytes: head of the free list first, then
    /// the heap top, then a reorganize retry. Returns the allocation start,
    /// the heap ordinal for the new record, and whether origins moved.
    fn allocate(&mut self, need: usize) -> Result<(usize, u16, bool)> {
        let free_head = ph::free(self.data) as usize;
        if free_head != 0 {
            let offsets = decode_offsets(self.data, free_head, self.desc)
                .map_err(|e| self.attach_page(e))?;
            let avail = offsets.total_size();
            if avail >= need {
                let heap_no = field::heap_no(self.data, free_head);
                let next_free = self.next_of(free_head)?.unwrap_or(0);
                ph::set_free(self.data, next_free as u16);
                ph::set_garbage(
                    self.data,
                    (ph::garbage(self.data) as usize - need) as u16,
                );
                let start = free_head - offsets.extra_size();
                return Ok((start, heap_no, false));
            }
        }

        if let Some(start) = self.heap_alloc(need) {
            return Ok((start, self.take_heap_no()?, false));
        }

        // The heap is exhausted; garbage may still cover the request.
        if ph::garbage(self.data) as usize >= need {
            self.reorganize()?;
            if let Some(start) = self.heap_alloc(need) {
                return Ok((start, self.take_heap_no()?, true));
            }
        }
        Err(EngineError::PageFull)
    }

    /// Bumps the heap top if the allocation leaves room for one more
    /// directory slot, so a following split cannot fail.
    fn heap_alloc(&mut self, need: usize) -> Option<usize> {
        let top = ph::heap_top(self.data) as usize;
        let n = ph::n_dir_slots(self.data) as usize;
        if top + need <= dir::low_water(self.data.len(), n + 1) {
            ph::set_heap_top(self.data, (top + need) as u16);
            Some(top)
        } else {
            None
        }
    }

    fn take_heap_no(&mut self) -> Result<u16> {
        let n_heap = ph::n_heap(self.data);
        if n_heap > crate::record::header::MAX_HEAP_NO {
            return Err(EngineError::PageFull);
        }
        ph::set_n_heap(self.data, n_heap + 1);
        Ok(n_heap)
    }

    fn note_insert_direction(&mut self, prev: usize, origin: usize) {
        let last = ph::last_insert(self.data) as usize;
        if last != 0 && last == prev {
            ph::set_direction(self.data, Direction::Right);
            ph::set_n_direction(self.data, ph::n_direction(self.data) + 1);
        } else if last != 0 && self.next_of(origin).ok().flatten() == Some(last) {
            ph::set_direction(self.data, Direction::Left);
            ph::set_n_direction(self.data, ph::n_direction(self.data) + 1);
        } else {
            ph::set_direction(self.data, Direction::None);
            ph::set_n_direction(self.data, 0);
        }
        ph::set_last_insert(self.data, origin as u16);
    }

    /// Splits slot `s`: a new slot is inserted below it anchoring the
    /// record at position floor(owned/2) along the group's chain.
    fn split_slot(&mut self, s: usize) -> Result<()> {
        let n = ph::n_dir_slots(self.data) as usize;
        let anchor = dir::slot(self.data, s) as usize;
        let k = field::owned(self.data, anchor) as usize;

        let heap_top = ph::heap_top(self.data) as usize;
        if dir::low_water(self.data.len(), n + 1) < heap_top {
            return Err(self.corrupt("no room left for a directory slot split"));
        }

        // Group records run from just after the previous anchor.
        let prev_anchor = dir::slot(self.data, s - 1) as usize;
        let mut new_anchor = self
            .next_of(prev_anchor)?
            .ok_or_else(|| self.corrupt("empty group during slot split"))?;
        for _ in 0..(k / 2).saturating_sub(1) {
            new_anchor = self
                .next_of(new_anchor)?
                .ok_or_else(|| self.corrupt("group shorter than its owned-count"))?;
        }

        // Shift slots s..n-1 one position down-address to open index s.
        for i in (s..n).rev() {
            let v = dir::slot(self.data, i);
            dir::set_slot(self.data, i + 1, v);
        }
        ph::set_n_dir_slots(self.data, (n + 1) as u16);

        dir::set_slot(self.data, s, new_anchor as u16);
        field::set_owned(self.data, new_anchor, (k / 2) as u8);
        field::set_owned(self.data, anchor, (k - k / 2) as u8);
        Ok(())
    }

    /// Re-balances slot `s` after its owned-count dropped below the
    /// minimum: borrow one record from a neighbor that can spare it, or
    /// merge the two groups. Slot 0 is never balanced.
    fn balance_slot(&mut self, s: usize) -> Result<()> {
        let n = ph::n_dir_slots(self.data) as usize;
        if s == 0 {
            return Ok(());
        }
        if s >= 2 {
            // Balance against the neighbor anchoring smaller keys.
            let nb_anchor = dir::slot(self.data, s - 1) as usize;
            let nb_owned = field::owned(self.data, nb_anchor);
            let anchor = dir::slot(self.data, s) as usize;
            if nb_owned > DIR_SLOT_MIN_OWNED {
                // Transfer the neighbor's anchor record into group s.
                let nb_first = {
                    let below = dir::slot(self.data, s - 2) as usize;
                    self.next_of(below)?
                        .ok_or_else(|| self.corrupt("empty group during balance"))?
                };
                let mut pred = nb_first;
                while self.next_of(pred)? != Some(nb_anchor) {
                    pred = self
                        .next_of(pred)?
                        .ok_or_else(|| self.corrupt("group shorter than its owned-count"))?;
                }
                dir::set_slot(self.data, s - 1, pred as u16);
                field::set_owned(self.data, pred, nb_owned - 1);
                field::set_owned(self.data, nb_anchor, 0);
                let owned = field::owned(self.data, anchor);
                field::set_owned(self.data, anchor, owned + 1);
            } else {
                // Merge group s-1 into group s.
                let owned = field::owned(self.data, anchor) + nb_owned;
                field::set_owned(self.data, nb_anchor, 0);
                field::set_owned(self.data, anchor, owned);
                self.remove_slot(s - 1);
                if owned > DIR_SLOT_MAX_OWNED {
                    self.split_slot(s - 1)?;
                }
            }
            return Ok(());
        }
        // s == 1: the only lower neighbor is the infimum slot, which owns
        // exactly one record; balance upward instead when possible.
        if n > 2 {
            let anchor = dir::slot(self.data, 1) as usize;
            let up_anchor = dir::slot(self.data, 2) as usize;
            let up_owned = field::owned(self.data, up_anchor);
            if up_owned > DIR_SLOT_MIN_OWNED {
                // Adopt the first record of the upper group.
                let adopted = self
                    .next_of(anchor)?
                    .ok_or_else(|| self.corrupt("empty group during balance"))?;
                let owned = field::owned(self.data, anchor);
                field::set_owned(self.data, adopted, owned + 1);
                field::set_owned(self.data, anchor, 0);
                dir::set_slot(self.data, 1, adopted as u16);
                field::set_owned(self.data, up_anchor, up_owned - 1);
            } else {
                let owned = field::owned(self.data, anchor) + up_owned;
                field::set_owned(self.data, anchor, 0);
                field::set_owned(self.data, up_anchor, owned);
                self.remove_slot(1);
                if owned > DIR_SLOT_MAX_OWNED {
                    self.split_slot(1)?;
                }
            }
        }
        Ok(())
    }

    fn remove_slot(&mut self, i: usize) {
        let n = ph::n_dir_slots(self.data) as usize;
        for j in i..n - 1 {
            let v = dir::slot(self.data, j + 1);
            dir::set_slot(self.data, j, v);
        }
        ph::set_n_dir_slots(self.data, (n - 1) as u16);
    }

    fn corrupt(&self, reason: &str) -> EngineError {
        EngineError::Corrupted(self.page_id(), reason.to_string())
    }

    fn attach_page(&self, e: EngineError) -> EngineError {
        match e {
            EngineError::CorruptRecord(reason) => EngineError::Corrupted(self.page_id(), reason),
            other => other,
        }
    }
}

/// Relative chain offset between two origins.
fn rel(from: usize, to: usize) -> i16 {
    (to as isize - from as isize) as i16
}
