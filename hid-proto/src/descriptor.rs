//! HID report descriptor parsing: item stream in, field table out.
//!
//! The parser runs the global/local item state machine from the HID spec:
//! global items (usage page, logical range, report size/count/id) persist
//! until overwritten or popped, local items (usages, usage ranges) apply
//! only to the next main item, and each Input/Output/Feature main item
//! consumes the accumulated state to emit one [`Field`] record, then
//! clears the locals.
//!
//! A [`Field`] covers a whole main item: `slots` positions of `bit_width`
//! bits each, laid out back to back from `bit_offset`. For variable items
//! slot *i* carries the *i*-th usage; for array items every slot carries
//! an index selecting one usage out of the item's usage set. This keeps
//! the table bounded even for NKRO-style items declaring hundreds of
//! usages via a min/max range.
//!
//! Robustness rules (the descriptor comes from an untrusted device):
//! - every table has a fixed capacity; exceeding it is a [`ParseError`]
//! - bit cursors are validated against [`MAX_REPORT_BYTES`]
//! - unknown item tags are skipped, not fatal
//! - truncated items surface as [`ParseError::UnexpectedEnd`]
//!
//! Within one report id fields never overlap: each emission advances that
//! report's bit cursor by exactly `bit_width * slots`.

use heapless::Vec;

use crate::items::{Item, ItemClass, Items};
use crate::usage::Usage;

/// Maximum number of fields across all reports of one descriptor.
pub const MAX_FIELDS: usize = 64;

/// Maximum number of distinct report ids per descriptor.
pub const MAX_REPORT_IDS: usize = 16;

/// Maximum byte length of a single report (USB full-speed interrupt packet).
pub const MAX_REPORT_BYTES: usize = 64;

/// Maximum discrete usages recorded per field before falling back to the
/// repeat-last rule.
pub const MAX_FIELD_USAGES: usize = 8;

const MAX_COLLECTION_DEPTH: usize = 8;
const MAX_GLOBAL_STACK: usize = 4;
const MAX_APP_COLLECTIONS: usize = 8;
const MAX_LOCAL_USAGES: usize = 16;

/// Structural parse failure. Recoverable by design: the caller keeps
/// whatever empty/partial table it had and degrades to fewer mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ParseError {
    /// An item declared more payload than the descriptor contains.
    UnexpectedEnd,
    /// More main items than the field table can hold.
    TooManyFields,
    /// More report ids than the layout table can hold.
    TooManyReports,
    /// A report grew past [`MAX_REPORT_BYTES`].
    ReportTooLong,
    /// Collection or Push/Pop nesting exceeded its fixed depth.
    DepthExceeded,
}

/// Direction of a report, from the main item that declared its fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReportKind {
    Input,
    Output,
    Feature,
}

impl ReportKind {
    #[inline]
    const fn index(self) -> usize {
        match self {
            ReportKind::Input => 0,
            ReportKind::Output => 1,
            ReportKind::Feature => 2,
        }
    }
}

/// Main-item flag bits the remapper cares about.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FieldFlags(u8);

impl FieldFlags {
    const CONSTANT: u8 = 1 << 0;
    const RELATIVE: u8 = 1 << 1;
    const ARRAY: u8 = 1 << 2;

    /// Decode from the Input/Output/Feature item payload.
    /// Bit 0: constant, bit 1: variable (0 = array), bit 2: relative.
    /// The array/variable distinction only exists for data items; constant
    /// padding is never an array.
    #[must_use]
    pub fn from_main_item(value: u32) -> Self {
        let mut bits = 0;
        if value & 0x01 != 0 {
            bits |= Self::CONSTANT;
        } else if value & 0x02 == 0 {
            bits |= Self::ARRAY;
        }
        if value & 0x04 != 0 {
            bits |= Self::RELATIVE;
        }
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn is_constant(self) -> bool {
        self.0 & Self::CONSTANT != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_array(self) -> bool {
        self.0 & Self::ARRAY != 0
    }

    #[inline]
    #[must_use]
    pub const fn is_relative(self) -> bool {
        self.0 & Self::RELATIVE != 0
    }
}

/// The usage set one field enumerates.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Usages {
    /// Constant padding; no usage at all.
    None,
    /// Discrete usages listed by Usage items (repeat-last applies past the end).
    List(Vec<Usage, MAX_FIELD_USAGES>),
    /// A Usage Minimum/Maximum range on one page.
    Range { page: u16, min: u16, max: u16 },
}

impl Usages {
    /// Usage at slot/array index `i`, per the HID repeat-last rule for
    /// lists and min+i for ranges.
    #[must_use]
    pub fn at(&self, i: usize) -> Option<Usage> {
        match self {
            Usages::None => None,
            Usages::List(list) => list.get(i).or_else(|| list.last()).copied(),
            Usages::Range { page, min, max } => {
                let id = (*min as usize).checked_add(i)?;
                (id <= *max as usize).then(|| Usage::new(*page, id as u16))
            }
        }
    }

    /// Index of `usage` inside this set, if present.
    #[must_use]
    pub fn index_of(&self, usage: Usage) -> Option<usize> {
        match self {
            Usages::None => None,
            Usages::List(list) => list.iter().position(|&u| u == usage),
            Usages::Range { page, min, max } => (*page == usage.page
                && (*min..=*max).contains(&usage.id))
            .then(|| (usage.id - min) as usize),
        }
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, usage: Usage) -> bool {
        self.index_of(usage).is_some()
    }
}

/// One decoded main item: a run of `slots` equally sized positions inside
/// one report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Field {
    pub report_id: u8,
    pub kind: ReportKind,
    /// Bit position of slot 0 within the report payload (report id byte
    /// excluded).
    pub bit_offset: u16,
    /// Size of one slot in bits.
    pub bit_width: u8,
    /// Number of slots (the item's report count).
    pub slots: u16,
    pub logical_min: i32,
    pub logical_max: i32,
    pub flags: FieldFlags,
    pub usages: Usages,
}

impl Field {
    /// Whether extracted values must be sign-extended.
    #[inline]
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        self.logical_min < 0
    }

    /// Bit position of slot `i`.
    #[inline]
    #[must_use]
    pub fn slot_offset(&self, i: usize) -> u16 {
        self.bit_offset + (i as u16) * self.bit_width as u16
    }

    /// Total bits covered by this field.
    #[inline]
    #[must_use]
    pub fn bit_len(&self) -> u32 {
        self.bit_width as u32 * self.slots as u32
    }
}

/// A field together with the slot index resolved for one specific usage.
#[derive(Clone, Copy, Debug)]
pub struct FieldRef<'a> {
    pub field: &'a Field,
    pub slot: usize,
}

impl FieldRef<'_> {
    #[inline]
    #[must_use]
    pub fn bit_offset(&self) -> u16 {
        self.field.slot_offset(self.slot)
    }

    #[inline]
    #[must_use]
    pub fn bit_width(&self) -> u8 {
        self.field.bit_width
    }
}

/// Bit cursor per report id, one lane per [`ReportKind`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct ReportLayout {
    id: u8,
    bits: [u16; 3],
}

/// Parsed descriptor: the flat field table plus report layout metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReportDescriptor {
    fields: Vec<Field, MAX_FIELDS>,
    layouts: Vec<ReportLayout, MAX_REPORT_IDS>,
    /// Usages of top-level (application) collections, in declaration order.
    pub app_collections: Vec<Usage, MAX_APP_COLLECTIONS>,
    /// True when any Report ID item appeared; reports are then prefixed
    /// with their id byte on the wire.
    pub uses_report_ids: bool,
}

/// Global item state, saved/restored by Push/Pop.
#[derive(Clone, Copy, Debug)]
struct Globals {
    usage_page: u16,
    logical_min: i32,
    logical_max: i32,
    /// Unsigned reinterpretation of the Logical Maximum payload, kept for
    /// descriptors that encode e.g. 255 as a single 0xFF byte (which
    /// sign-extends to -1 and lands below the minimum).
    logical_max_unsigned: i32,
    report_size: u32,
    report_count: u32,
    report_id: u8,
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            usage_page: 0,
            logical_min: 0,
            logical_max: 0,
            logical_max_unsigned: 0,
            report_size: 0,
            report_count: 0,
            report_id: 0,
        }
    }
}

/// Local item state, cleared after every main item.
#[derive(Clone, Debug, Default)]
struct Locals {
    usages: Vec<Usage, MAX_LOCAL_USAGES>,
    usage_min: Option<(u16, u16)>,
    usage_max: Option<(u16, u16)>,
}

impl Locals {
    fn clear(&mut self) {
        self.usages.clear();
        self.usage_min = None;
        self.usage_max = None;
    }

    /// Resolve a Usage/UsageMin/UsageMax payload: 4-byte items carry their
    /// own page in the high half, shorter ones inherit the current page.
    fn resolve(item: &Item<'_>, usage_page: u16) -> (u16, u16) {
        let value = item.udata();
        if item.data.len() == 4 {
            ((value >> 16) as u16, value as u16)
        } else {
            (usage_page, value as u16)
        }
    }
}

impl ReportDescriptor {
    /// Parse a raw descriptor byte stream into a field table.
    ///
    /// Item tags the remapper has no use for (units, physical ranges,
    /// designators, delimiters, long items) are skipped.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let mut desc = ReportDescriptor::default();
        let mut globals = Globals::default();
        let mut global_stack: Vec<Globals, MAX_GLOBAL_STACK> = Vec::new();
        let mut locals = Locals::default();
        let mut depth: usize = 0;

        for item in Items::new(bytes) {
            let item = item?;
            match item.class {
                ItemClass::Main => {
                    match item.tag {
                        0x8 => desc.emit(ReportKind::Input, &globals, &locals, item.udata())?,
                        0x9 => desc.emit(ReportKind::Output, &globals, &locals, item.udata())?,
                        0xB => desc.emit(ReportKind::Feature, &globals, &locals, item.udata())?,
                        0xA => {
                            if depth >= MAX_COLLECTION_DEPTH {
                                return Err(ParseError::DepthExceeded);
                            }
                            if depth == 0 {
                                if let Some(&usage) = locals.usages.first() {
                                    let _ = desc.app_collections.push(usage);
                                }
                            }
                            depth += 1;
                        }
                        0xC => {
                            // Unmatched End Collection is tolerated.
                            depth = depth.saturating_sub(1);
                        }
                        _ => crate::warn_unknown_tag(item.tag),
                    }
                    locals.clear();
                }
                ItemClass::Global => match item.tag {
                    0x0 => globals.usage_page = item.udata() as u16,
                    0x1 => globals.logical_min = item.sdata(),
                    0x2 => {
                        globals.logical_max = item.sdata();
                        globals.logical_max_unsigned =
                            item.udata().min(i32::MAX as u32) as i32;
                    }
                    0x7 => globals.report_size = item.udata(),
                    0x8 => {
                        globals.report_id = item.udata() as u8;
                        desc.uses_report_ids = true;
                    }
                    0x9 => globals.report_count = item.udata(),
                    0xA => {
                        global_stack
                            .push(globals)
                            .map_err(|_| ParseError::DepthExceeded)?;
                    }
                    0xB => {
                        // Pop without a matching Push is tolerated.
                        if let Some(saved) = global_stack.pop() {
                            globals = saved;
                        }
                    }
                    // Physical range, unit, unit exponent.
                    0x3..=0x6 => {}
                    _ => crate::warn_unknown_tag(item.tag),
                },
                ItemClass::Local => match item.tag {
                    0x0 => {
                        let (page, id) = Locals::resolve(&item, globals.usage_page);
                        // Past capacity the repeat-last rule takes over.
                        let _ = locals.usages.push(Usage::new(page, id));
                    }
                    0x1 => locals.usage_min = Some(Locals::resolve(&item, globals.usage_page)),
                    0x2 => locals.usage_max = Some(Locals::resolve(&item, globals.usage_page)),
                    // Designators, strings, delimiters.
                    _ => {}
                },
                ItemClass::Reserved => crate::warn_unknown_tag(item.tag),
            }
        }

        Ok(desc)
    }

    /// Emit one field record for an Input/Output/Feature main item.
    fn emit(
        &mut self,
        kind: ReportKind,
        globals: &Globals,
        locals: &Locals,
        main_flags: u32,
    ) -> Result<(), ParseError> {
        let bit_len = globals
            .report_size
            .checked_mul(globals.report_count)
            .ok_or(ParseError::ReportTooLong)?;
        if bit_len == 0 {
            return Ok(());
        }

        let offset = self.advance_cursor(globals.report_id, kind, bit_len)?;

        let mut flags = FieldFlags::from_main_item(main_flags);
        // Slots wider than the codec can represent are kept only as
        // opaque constants so the cursor still advances past them.
        if globals.report_size > 32 {
            flags = FieldFlags(flags.0 | FieldFlags::CONSTANT);
        }

        let usages = if flags.is_constant() {
            Usages::None
        } else {
            match (locals.usage_min, locals.usage_max) {
                (Some((page, min)), Some((max_page, max))) if page == max_page && min <= max => {
                    Usages::Range { page, min, max }
                }
                _ if locals.usages.is_empty() => Usages::None,
                _ => Usages::List(locals.usages.iter().take(MAX_FIELD_USAGES).copied().collect()),
            }
        };

        // A data item without any usage is just padding.
        if matches!(usages, Usages::None) && !flags.is_constant() {
            return Ok(());
        }

        // Repair the logical range where the maximum sign-extended below
        // the minimum.
        let logical_min = globals.logical_min;
        let logical_max = if globals.logical_max < logical_min {
            globals.logical_max_unsigned
        } else {
            globals.logical_max
        };

        self.fields
            .push(Field {
                report_id: globals.report_id,
                kind,
                bit_offset: offset,
                bit_width: globals.report_size as u8,
                slots: globals.report_count as u16,
                logical_min,
                logical_max,
                flags,
                usages,
            })
            .map_err(|_| ParseError::TooManyFields)?;
        Ok(())
    }

    /// Reserve `bit_len` bits in the given report lane, returning the
    /// start offset. Fails when the report would outgrow
    /// [`MAX_REPORT_BYTES`].
    fn advance_cursor(
        &mut self,
        report_id: u8,
        kind: ReportKind,
        bit_len: u32,
    ) -> Result<u16, ParseError> {
        let idx = match self.layouts.iter().position(|l| l.id == report_id) {
            Some(idx) => idx,
            None => {
                self.layouts
                    .push(ReportLayout {
                        id: report_id,
                        bits: [0; 3],
                    })
                    .map_err(|_| ParseError::TooManyReports)?;
                self.layouts.len() - 1
            }
        };
        let cursor = &mut self.layouts[idx].bits[kind.index()];
        let end = (*cursor as u32)
            .checked_add(bit_len)
            .ok_or(ParseError::ReportTooLong)?;
        if end > (MAX_REPORT_BYTES * 8) as u32 {
            return Err(ParseError::ReportTooLong);
        }
        let offset = *cursor;
        *cursor = end as u16;
        Ok(offset)
    }

    /// All fields, in declaration order.
    #[inline]
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Fields of one report id and kind, in bit order.
    pub fn report_fields(
        &self,
        report_id: u8,
        kind: ReportKind,
    ) -> impl Iterator<Item = &Field> + '_ {
        self.fields
            .iter()
            .filter(move |f| f.report_id == report_id && f.kind == kind)
    }

    /// Payload length in bytes of one report (report id byte excluded).
    #[must_use]
    pub fn report_len(&self, report_id: u8, kind: ReportKind) -> usize {
        self.layouts
            .iter()
            .find(|l| l.id == report_id)
            .map(|l| (l.bits[kind.index()] as usize).div_ceil(8))
            .unwrap_or(0)
    }

    /// Report ids that declare at least one field of `kind`.
    pub fn report_ids(&self, kind: ReportKind) -> impl Iterator<Item = u8> + '_ {
        self.layouts
            .iter()
            .filter(move |l| l.bits[kind.index()] > 0)
            .map(|l| l.id)
    }

    /// Look up the non-constant input field slot carrying `usage` within
    /// one report.
    #[must_use]
    pub fn input_field(&self, report_id: u8, usage: Usage) -> Option<FieldRef<'_>> {
        self.report_fields(report_id, ReportKind::Input)
            .filter(|f| !f.flags.is_constant())
            .find_map(|field| {
                field
                    .usages
                    .index_of(usage)
                    .map(|slot| FieldRef { field, slot })
            })
    }

    /// Look up `usage` across all input reports.
    #[must_use]
    pub fn find_input(&self, usage: Usage) -> Option<FieldRef<'_>> {
        self.fields
            .iter()
            .filter(|f| f.kind == ReportKind::Input && !f.flags.is_constant())
            .find_map(|field| {
                field
                    .usages
                    .index_of(usage)
                    .map(|slot| FieldRef { field, slot })
            })
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
