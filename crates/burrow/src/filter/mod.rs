//! Table filters: Bloom and cuckoo variants behind one builder surface.

pub mod bloom;
pub mod cuckoo;

use crate::options::{DirOptions, FilterKind};

/// Per-table filter builder, selected by directory options.
#[derive(Debug)]
pub enum FilterBuilder {
    /// Filtering disabled; tables carry no filter block.
    None,
    /// Bloom variant.
    Bloom(bloom::BloomBuilder),
    /// Cuckoo variant.
    Cuckoo(cuckoo::CuckooBuilder),
}

impl FilterBuilder {
    /// Creates the builder the options call for.
    pub fn from_options(options: &DirOptions) -> Self {
        if !options.filtering_enabled() {
            return Self::None;
        }
        match options.filter {
            FilterKind::None => Self::None,
            FilterKind::Bloom => Self::Bloom(bloom::BloomBuilder::new(options.bf_bits_per_key)),
            FilterKind::Cuckoo => Self::Cuckoo(cuckoo::CuckooBuilder::new(
                options.cuckoo_fp_bits,
                options.cuckoo_value_bits,
                options.cuckoo_frac,
            )),
        }
    }

    /// Feeds one key to the filter.
    pub fn add_key(&mut self, key: &[u8]) {
        match self {
            Self::None => {}
            Self::Bloom(builder) => builder.add_key(key),
            Self::Cuckoo(builder) => builder.add_key(key, 0),
        }
    }

    /// Emits the filter block for the finishing table and resets the
    /// builder. Returns an empty block when filtering is disabled.
    pub fn finish(&mut self) -> Vec<u8> {
        match self {
            Self::None => Vec::new(),
            Self::Bloom(builder) => builder.finish(),
            Self::Cuckoo(builder) => builder.finish(),
        }
    }

    /// Cuckoo victims spilled so far (zero for other variants).
    pub fn num_victims(&self) -> u64 {
        match self {
            Self::Cuckoo(builder) => builder.num_victims(),
            _ => 0,
        }
    }
}

/// Probes a filter block emitted by `FilterBuilder::finish`. Returns
/// true when the key may be present. An empty block (filtering off)
/// is always a maybe.
pub fn may_contain(kind: FilterKind, block: &[u8], key: &[u8]) -> bool {
    if block.is_empty() {
        return true;
    }
    match kind {
        FilterKind::None => true,
        FilterKind::Bloom => bloom::may_contain(block, key),
        FilterKind::Cuckoo => match cuckoo::lookup(block, key) {
            Some(matches) => !matches.is_empty(),
            None => true,
        },
    }
}
