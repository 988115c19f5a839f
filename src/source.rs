use async_trait::async_trait;

use crate::error::SourceError;
use crate::parser::ProductRecord;

/// A rendered product list that can be asked to load more rows.
///
/// Snapshots must be append-only across calls: rows already returned keep
/// their position, new rows only appear at the end. The extraction loop diffs
/// snapshots by length and relies on this.
#[async_trait]
pub trait ProductSource {
    /// Ask the page to reveal more rows (scroll to the bottom).
    async fn reveal_more(&mut self) -> Result<(), SourceError>;

    /// Number of product rows currently rendered.
    async fn count(&mut self) -> Result<usize, SourceError>;

    /// Every rendered row, parsed, in rendering order.
    async fn snapshot(&mut self) -> Result<Vec<ProductRecord>, SourceError>;
}
