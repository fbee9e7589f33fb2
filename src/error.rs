use derive_more::{Display, From};

pub type Result<T> = core::result::Result<T, MetaballError>;

#[derive(Debug, Display, From)]
#[display("{self:?}")]
pub enum MetaballError {
    /// The requested grid resolution overflows or cannot be allocated.
    ///
    /// The whole pass fails; the caller may retry at a lower quality tier.
    GridAllocation { resolution: usize },
}

impl std::error::Error for MetaballError {}
