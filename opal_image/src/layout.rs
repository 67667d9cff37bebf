//! Text-segment layout and call relocation.
//!
//! Packs an ordered list of code objects into one contiguous text region
//! and resolves every displacement-limited direct call between them,
//! inserting call trampolines only when a call could otherwise overflow its
//! encodable range.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐   place/scan    ┌──────────────────┐    commands    ┌─────────────┐
//! │ CodeObjects │ ──────────────▶ │    Relocator     │ ─────────────▶ │ ImageWriter │
//! │ (ordered)   │                 │ pending indices  │                │  (external) │
//! └─────────────┘                 │ trampoline pass  │                └─────────────┘
//!                                 └──────────────────┘
//! ```
//!
//! Backward calls are resolved the moment their caller is placed. Forward
//! calls are tracked in two indices at once: a FIFO ordered by text offset
//! (the oldest entry is always the one nearest exhausting its positive
//! range) and a per-destination bucket used to resolve every pending call
//! the moment its destination arrives. Both indices hold handles into one
//! pending-call arena.
//!
//! Trampolines are inserted as late as possible: after each placement the
//! engine checks whether the oldest pending call could still reach a
//! conservative worst-case boundary one more object away, and only when it
//! could not does it relay the call through a trampoline. A failure past
//! that protocol (an unencodable displacement, or pending state surviving
//! the run) is a bug in the ISA policy or the bound, and panics.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use opal_core::callsite::{CallKind, CallSite, CallTarget, CodeId};
use opal_core::isa::IsaPolicy;

use crate::object::CodeObject;

// =============================================================================
// Image Commands
// =============================================================================

/// One placement in the output command stream, in ascending offset order.
///
/// Offsets are absolute within the text region; the image writer must
/// preserve them exactly.
#[derive(Debug, Clone)]
pub enum ImageCommand {
    /// Emit a code object's payload at `offset`.
    PlaceObject {
        /// Which object to emit.
        id: CodeId,
        /// Absolute text offset of the object's first byte.
        offset: u64,
    },
    /// Emit trampoline bytes at `offset`.
    PlaceTrampoline {
        /// The finished stub bytes.
        bytes: Box<[u8]>,
        /// Absolute text offset of the stub's first byte.
        offset: u64,
    },
}

impl ImageCommand {
    /// The absolute text offset this command writes to.
    #[inline]
    pub fn offset(&self) -> u64 {
        match self {
            ImageCommand::PlaceObject { offset, .. } => *offset,
            ImageCommand::PlaceTrampoline { offset, .. } => *offset,
        }
    }

    /// Whether this command places a trampoline.
    #[inline]
    pub fn is_trampoline(&self) -> bool {
        matches!(self, ImageCommand::PlaceTrampoline { .. })
    }
}

// =============================================================================
// Layout Output
// =============================================================================

/// The result of one relocation run.
#[derive(Debug)]
pub struct TextLayout {
    commands: Vec<ImageCommand>,
    offsets: Vec<u64>,
    text_size: u64,
    stats: LayoutStats,
}

impl TextLayout {
    /// The placement command stream, in ascending offset order.
    #[inline]
    pub fn commands(&self) -> &[ImageCommand] {
        &self.commands
    }

    /// Final text offset of a placed code object.
    #[inline]
    pub fn object_offset(&self, id: CodeId) -> u64 {
        self.offsets[id.index()]
    }

    /// Total size of the text region in bytes.
    #[inline]
    pub fn text_size(&self) -> u64 {
        self.text_size
    }

    /// Counters from the run.
    #[inline]
    pub fn stats(&self) -> &LayoutStats {
        &self.stats
    }
}

/// Counters describing one relocation run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayoutStats {
    /// Objects placed.
    pub objects_placed: usize,
    /// Calls resolved at caller placement (backward, self, and stub calls).
    pub calls_resolved_eagerly: usize,
    /// Forward calls resolved when their destination arrived.
    pub calls_resolved_on_arrival: usize,
    /// Forward calls relayed through a trampoline.
    pub calls_via_trampoline: usize,
    /// Trampolines emitted.
    pub trampolines_emitted: usize,
    /// Critical calls served by an already-emitted trampoline.
    pub trampolines_reused: usize,
}

// =============================================================================
// Pending State
// =============================================================================

/// A forward call waiting for its destination, held in the pending arena.
#[derive(Debug, Clone, Copy)]
struct PendingCall {
    caller: CodeId,
    /// Offset of the call instruction inside the caller.
    source_offset: u32,
    /// Absolute text offset of the call instruction.
    text_offset: u64,
    callee: CodeId,
    kind: CallKind,
    resolved: bool,
}

/// A trampoline whose internal jump still awaits its destination's offset.
#[derive(Debug, Clone, Copy)]
struct UnresolvedTrampoline {
    destination: CodeId,
    kind: CallKind,
    /// Index of the stub's `PlaceTrampoline` command.
    command_index: usize,
    offset: u64,
}

// =============================================================================
// Relocator
// =============================================================================

/// Single-pass layout engine for one text region.
///
/// Deterministic given input order; runs synchronously at build time with
/// no shared state beyond its own indices.
pub struct Relocator<'p, P: IsaPolicy> {
    policy: &'p P,

    next_offset: u64,
    text_offsets: Vec<Option<u64>>,
    commands: Vec<ImageCommand>,

    // Conservative worst-case input bounds from the pre-scan.
    max_object_size: u64,
    max_calls_per_object: u64,

    // Pending forward calls: one arena, two indices.
    pending: Vec<PendingCall>,
    all_unresolved: VecDeque<usize>,
    by_destination: FxHashMap<CodeId, SmallVec<[usize; 4]>>,

    trampoline_offsets: FxHashMap<CodeId, u64>,
    unresolved_trampolines: Vec<UnresolvedTrampoline>,

    stats: LayoutStats,
}

impl<'p, P: IsaPolicy> Relocator<'p, P> {
    /// Create a relocator for one run.
    pub fn new(policy: &'p P) -> Self {
        Self {
            policy,
            next_offset: 0,
            text_offsets: Vec::new(),
            commands: Vec::new(),
            max_object_size: 0,
            max_calls_per_object: 0,
            pending: Vec::new(),
            all_unresolved: VecDeque::new(),
            by_destination: FxHashMap::default(),
            trampoline_offsets: FxHashMap::default(),
            unresolved_trampolines: Vec::new(),
            stats: LayoutStats::default(),
        }
    }

    /// Place every object, resolve every call, and return the command
    /// stream. Call-site tables are cleared on the way out; a placed object
    /// carries no residual layout metadata.
    ///
    /// # Panics
    /// Panics when a resolved displacement cannot be encoded or pending
    /// state survives the run. Both indicate a bug in the ISA policy or the
    /// worst-case bound, not bad input.
    pub fn relocate(mut self, objects: &mut [CodeObject]) -> TextLayout {
        self.prescan(objects);
        self.text_offsets = vec![None; objects.len()];

        for index in 0..objects.len() {
            let id = CodeId::new(index as u32);
            let offset = self.next_offset;
            self.text_offsets[index] = Some(offset);
            self.commands.push(ImageCommand::PlaceObject { id, offset });
            self.next_offset += objects[index].size();
            self.stats.objects_placed += 1;

            self.scan_call_sites(objects, id, offset);
            self.resolve_arrivals(objects, id, offset);
            self.trampoline_pass(objects);
        }

        self.finish(objects)
    }

    /// Worst-case input bounds. Only ever used as an upper bound on how far
    /// one more placement could push pending calls.
    fn prescan(&mut self, objects: &[CodeObject]) {
        for object in objects {
            self.max_object_size = self.max_object_size.max(object.size());
            self.max_calls_per_object =
                self.max_calls_per_object.max(object.call_sites().len() as u64);
        }
    }

    /// Resolve or enqueue every call site of the object just placed.
    fn scan_call_sites(&mut self, objects: &mut [CodeObject], id: CodeId, object_offset: u64) {
        let sites: SmallVec<[CallSite; 8]> =
            objects[id.index()].call_sites().sites().iter().copied().collect();

        for site in sites {
            assert!(
                (site.offset as u64) < objects[id.index()].size(),
                "call site past the end of its object"
            );
            let text_offset = object_offset + site.offset as u64;

            match site.target {
                CallTarget::Stub(stub_offset) => {
                    // Stubs live at pre-assigned offsets and must be directly
                    // reachable; they are never trampolined.
                    self.write_displacement(
                        objects,
                        id,
                        site.offset,
                        site.kind,
                        stub_offset as i64 - text_offset as i64,
                    );
                    self.stats.calls_resolved_eagerly += 1;
                }
                CallTarget::Code(callee) => {
                    let placed = self.text_offsets.get(callee.index()).copied().flatten();
                    if let Some(destination) = placed {
                        // Backward (or self) call: the destination is known.
                        self.write_displacement(
                            objects,
                            id,
                            site.offset,
                            site.kind,
                            destination as i64 - text_offset as i64,
                        );
                        self.stats.calls_resolved_eagerly += 1;
                    } else {
                        let handle = self.pending.len();
                        self.pending.push(PendingCall {
                            caller: id,
                            source_offset: site.offset,
                            text_offset,
                            callee,
                            kind: site.kind,
                            resolved: false,
                        });
                        self.all_unresolved.push_back(handle);
                        self.by_destination.entry(callee).or_default().push(handle);
                    }
                }
            }
        }
    }

    /// Resolve every pending call whose destination just became known.
    fn resolve_arrivals(&mut self, objects: &mut [CodeObject], id: CodeId, offset: u64) {
        let Some(bucket) = self.by_destination.remove(&id) else {
            return;
        };
        for handle in bucket {
            let call = self.pending[handle];
            debug_assert!(!call.resolved);
            self.write_displacement(
                objects,
                call.caller,
                call.source_offset,
                call.kind,
                offset as i64 - call.text_offset as i64,
            );
            self.pending[handle].resolved = true;
            self.stats.calls_resolved_on_arrival += 1;
        }
    }

    /// Front of the FIFO, dropping entries already resolved through the
    /// destination index.
    fn oldest_unresolved(&mut self) -> Option<usize> {
        while let Some(&front) = self.all_unresolved.front() {
            if self.pending[front].resolved {
                self.all_unresolved.pop_front();
            } else {
                return Some(front);
            }
        }
        None
    }

    /// Insert trampolines for calls that could not survive one more
    /// placement.
    ///
    /// The boundary is deliberately conservative: it assumes the next
    /// object is the largest in the input and that every distinct pending
    /// destination plus a full call table's worth of new calls will need a
    /// trampoline before this call gets another chance. Deferring past that
    /// bound could leave an already-emitted displacement field with no
    /// encodable value, so the bound errs early, never late.
    fn trampoline_pass(&mut self, objects: &mut [CodeObject]) {
        while let Some(front) = self.oldest_unresolved() {
            let call = self.pending[front];

            let future_boundary = self.next_offset
                + self.max_object_size
                + self.policy.trampoline_size()
                    * (self.by_destination.len() as u64 + self.max_calls_per_object);
            if self
                .policy
                .in_range(future_boundary as i64 - call.text_offset as i64)
            {
                // The oldest call survives one more placement; a nearer
                // destination may still appear and avoid a trampoline.
                break;
            }

            // Critical: resolve through a trampoline now.
            let trampoline = match self.trampoline_offsets.get(&call.callee) {
                Some(&existing)
                    if self
                        .policy
                        .in_range(existing as i64 - call.text_offset as i64) =>
                {
                    self.stats.trampolines_reused += 1;
                    existing
                }
                _ => self.allocate_trampoline(call.callee, call.kind),
            };

            self.write_displacement(
                objects,
                call.caller,
                call.source_offset,
                call.kind,
                trampoline as i64 - call.text_offset as i64,
            );
            self.pending[front].resolved = true;
            self.all_unresolved.pop_front();
            self.remove_from_bucket(call.callee, front);
            self.stats.calls_via_trampoline += 1;
        }
    }

    /// Place a zero-filled trampoline stub at the current offset. Its
    /// internal jump is written once the destination's final offset is
    /// known, in the post-pass.
    fn allocate_trampoline(&mut self, destination: CodeId, kind: CallKind) -> u64 {
        let size = self.policy.trampoline_size();
        let offset = self.next_offset;
        self.next_offset += size;

        let command_index = self.commands.len();
        self.commands.push(ImageCommand::PlaceTrampoline {
            bytes: vec![0u8; size as usize].into_boxed_slice(),
            offset,
        });
        self.trampoline_offsets.insert(destination, offset);
        self.unresolved_trampolines.push(UnresolvedTrampoline {
            destination,
            kind,
            command_index,
            offset,
        });
        self.stats.trampolines_emitted += 1;
        offset
    }

    /// Drop a pending handle from its destination bucket.
    fn remove_from_bucket(&mut self, callee: CodeId, handle: usize) {
        if let Some(bucket) = self.by_destination.get_mut(&callee) {
            bucket.retain(|h| *h != handle);
            if bucket.is_empty() {
                self.by_destination.remove(&callee);
            }
        }
    }

    /// Encode one resolved displacement in place.
    fn write_displacement(
        &self,
        objects: &mut [CodeObject],
        caller: CodeId,
        at: u32,
        kind: CallKind,
        distance: i64,
    ) {
        let payload = objects[caller.index()].payload_mut();
        let fits = self
            .policy
            .encode_displacement(payload, at as usize, kind, distance);
        assert!(
            fits,
            "direct-call displacement {distance} is outside the encodable range"
        );
    }

    /// Patch every trampoline's internal jump and verify nothing dangles.
    fn finish(mut self, objects: &mut [CodeObject]) -> TextLayout {
        for trampoline in std::mem::take(&mut self.unresolved_trampolines) {
            let destination = self.text_offsets[trampoline.destination.index()]
                .expect("trampoline destination was never placed");
            let ImageCommand::PlaceTrampoline { bytes, .. } =
                &mut self.commands[trampoline.command_index]
            else {
                unreachable!("trampoline handle does not name a trampoline command");
            };
            let fits = self.policy.encode_trampoline(
                bytes,
                trampoline.kind,
                trampoline.offset,
                destination,
            );
            assert!(fits, "trampoline jump is outside its encodable range");
        }

        assert!(
            self.pending.iter().all(|call| call.resolved),
            "unresolved call survived layout"
        );
        assert!(
            self.by_destination.is_empty(),
            "unresolved destination bucket survived layout"
        );
        while let Some(handle) = self.all_unresolved.pop_front() {
            debug_assert!(self.pending[handle].resolved);
        }

        for object in objects.iter_mut() {
            object.clear_call_sites();
        }

        TextLayout {
            commands: self.commands,
            offsets: self
                .text_offsets
                .into_iter()
                .map(|offset| offset.expect("object was never placed"))
                .collect(),
            text_size: self.next_offset,
            stats: self.stats,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use opal_core::callsite::{CallSiteTable, CallTarget};

    /// Tiny test architecture: four-byte transfer instruction with a signed
    /// 32-bit field, artificially narrowed displacement range, eight-byte
    /// trampoline with an unrestricted relay field.
    struct TestPolicy {
        lower: i64,
        upper: i64,
    }

    impl TestPolicy {
        const CALL_SIZE: i64 = 4;

        fn with_range(lower: i64, upper: i64) -> Self {
            Self { lower, upper }
        }
    }

    impl IsaPolicy for TestPolicy {
        fn trampoline_size(&self) -> u64 {
            8
        }

        fn displacement_bounds(&self) -> (i64, i64) {
            (self.lower, self.upper)
        }

        fn encode_displacement(
            &self,
            payload: &mut [u8],
            at: usize,
            _kind: CallKind,
            distance: i64,
        ) -> bool {
            if !self.in_range(distance) {
                return false;
            }
            let field = (distance - Self::CALL_SIZE) as i32;
            payload[at..at + 4].copy_from_slice(&field.to_le_bytes());
            true
        }

        fn decode_displacement(&self, payload: &[u8], at: usize) -> i64 {
            let field = i32::from_le_bytes([
                payload[at],
                payload[at + 1],
                payload[at + 2],
                payload[at + 3],
            ]);
            field as i64 + Self::CALL_SIZE
        }

        fn encode_trampoline(
            &self,
            stub: &mut [u8],
            _kind: CallKind,
            trampoline_offset: u64,
            destination_offset: u64,
        ) -> bool {
            let relay = destination_offset as i64 - trampoline_offset as i64;
            stub[0] = 0xF4;
            stub[1..5].copy_from_slice(&(relay as i32).to_le_bytes());
            true
        }
    }

    fn object_with_calls(size: usize, calls: &[(u32, CodeId)]) -> CodeObject {
        let mut table = CallSiteTable::new();
        for &(offset, callee) in calls {
            table.push(CallSite::new(
                offset,
                CallKind::DirectPcRelative,
                CallTarget::Code(callee),
            ));
        }
        CodeObject::new(vec![0u8; size]).with_call_sites(table)
    }

    #[test]
    fn test_backward_call_resolves_at_placement() {
        let policy = TestPolicy::with_range(-2008, 2008);
        let mut objects = vec![
            object_with_calls(32, &[]),
            object_with_calls(64, &[(12, CodeId::new(0))]),
        ];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.stats().calls_resolved_eagerly, 1);
        assert_eq!(layout.stats().trampolines_emitted, 0);
        // Caller sits at 32; its call instruction at text offset 44.
        assert_eq!(policy.decode_displacement(objects[1].payload(), 12), -44);
    }

    #[test]
    fn test_self_call_is_backward() {
        let policy = TestPolicy::with_range(-2008, 2008);
        let mut objects = vec![object_with_calls(64, &[(16, CodeId::new(0))])];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.stats().calls_resolved_eagerly, 1);
        assert_eq!(policy.decode_displacement(objects[0].payload(), 16), -16);
    }

    #[test]
    fn test_stub_call_resolves_at_placement() {
        let policy = TestPolicy::with_range(-2008, 2008);
        let mut table = CallSiteTable::new();
        table.push(CallSite::new(
            8,
            CallKind::TailPcRelative,
            CallTarget::Stub(0x400),
        ));
        let mut objects = vec![CodeObject::new(vec![0u8; 32]).with_call_sites(table)];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.stats().calls_resolved_eagerly, 1);
        assert_eq!(policy.decode_displacement(objects[0].payload(), 8), 0x3F8);
    }

    #[test]
    fn test_forward_call_resolves_on_arrival() {
        let policy = TestPolicy::with_range(-100, 100);
        let mut objects = vec![
            object_with_calls(16, &[(4, CodeId::new(2))]),
            object_with_calls(24, &[]),
            object_with_calls(8, &[]),
        ];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.stats().calls_resolved_on_arrival, 1);
        assert_eq!(layout.stats().trampolines_emitted, 0);
        assert_eq!(layout.object_offset(CodeId::new(2)), 40);
        assert_eq!(policy.decode_displacement(objects[0].payload(), 4), 36);
    }

    #[test]
    fn test_two_critical_calls_share_one_trampoline() {
        let policy = TestPolicy::with_range(-100, 100);
        // Both calls target the far object; the first forces a trampoline,
        // the second finds it still in range and reuses it.
        let mut objects = vec![
            object_with_calls(16, &[(0, CodeId::new(2)), (8, CodeId::new(2))]),
            object_with_calls(80, &[]),
            object_with_calls(8, &[]),
        ];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.stats().trampolines_emitted, 1);
        assert_eq!(layout.stats().trampolines_reused, 1);
        assert_eq!(layout.stats().calls_via_trampoline, 2);

        // Trampoline lands right after the caller, before the middle object.
        let trampolines: Vec<&ImageCommand> = layout
            .commands()
            .iter()
            .filter(|command| command.is_trampoline())
            .collect();
        assert_eq!(trampolines.len(), 1);
        assert_eq!(trampolines[0].offset(), 16);

        // Both call sites point at the trampoline.
        assert_eq!(policy.decode_displacement(objects[0].payload(), 0), 16);
        assert_eq!(policy.decode_displacement(objects[0].payload(), 8), 8);

        // The trampoline's relay jump reaches the destination placed later.
        let ImageCommand::PlaceTrampoline { bytes, offset } = trampolines[0] else {
            unreachable!();
        };
        let relay = i32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as i64;
        assert_eq!(*offset as i64 + relay, 104);
        assert_eq!(layout.object_offset(CodeId::new(2)), 104);
    }

    #[test]
    fn test_call_site_tables_cleared_after_layout() {
        let policy = TestPolicy::with_range(-2008, 2008);
        let mut objects = vec![
            object_with_calls(16, &[(4, CodeId::new(1))]),
            object_with_calls(16, &[(0, CodeId::new(0))]),
        ];

        Relocator::new(&policy).relocate(&mut objects);

        assert!(objects.iter().all(|object| object.call_sites().is_empty()));
    }

    #[test]
    fn test_text_size_and_offsets_are_contiguous() {
        let policy = TestPolicy::with_range(-2008, 2008);
        let mut objects = vec![
            object_with_calls(20, &[]),
            object_with_calls(44, &[]),
            object_with_calls(8, &[]),
        ];

        let layout = Relocator::new(&policy).relocate(&mut objects);

        assert_eq!(layout.object_offset(CodeId::new(0)), 0);
        assert_eq!(layout.object_offset(CodeId::new(1)), 20);
        assert_eq!(layout.object_offset(CodeId::new(2)), 64);
        assert_eq!(layout.text_size(), 72);
        assert_eq!(layout.commands().len(), 3);
    }

    #[test]
    #[should_panic(expected = "unresolved call survived layout")]
    fn test_dangling_forward_call_is_fatal() {
        let policy = TestPolicy::with_range(-2008, 2008);
        // The callee handle points past the input; the destination never
        // arrives.
        let mut objects = vec![
            object_with_calls(16, &[(4, CodeId::new(7))]),
            object_with_calls(16, &[]),
        ];

        Relocator::new(&policy).relocate(&mut objects);
    }

    #[test]
    #[should_panic(expected = "outside the encodable range")]
    fn test_unreachable_backward_call_is_fatal() {
        let policy = TestPolicy::with_range(-40, 2008);
        let mut objects = vec![
            object_with_calls(64, &[]),
            object_with_calls(16, &[(8, CodeId::new(0))]),
        ];

        Relocator::new(&policy).relocate(&mut objects);
    }
}
