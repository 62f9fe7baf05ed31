//! Product records and the search filter model.
//!
//! `ProductRecord` is deliberately the same shape on the wire (remote
//! catalog responses) and at rest (local cache rows), so pages fetched
//! while online can be upserted into the fallback store as-is.

use serde::{Deserialize, Serialize};

use crate::id::ProductId;

/// Stock above this count is considered healthy.
pub const LOW_STOCK_THRESHOLD: i64 = 5;

/// A product as exposed by the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: ProductId,
    pub name: String,
    pub category: String,
    /// Price in the smallest currency unit (e.g. cents).
    pub price: u64,
    pub stock: i64,
    pub barcode: Option<String>,
}

/// Tri-state stock filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockState {
    InStock,
    LowStock,
    OutOfStock,
}

impl StockState {
    /// Wire token used in query strings.
    pub fn as_str(&self) -> &'static str {
        match self {
            StockState::InStock => "in_stock",
            StockState::LowStock => "low_stock",
            StockState::OutOfStock => "out_of_stock",
        }
    }

    /// Whether a stock count falls into this state.
    pub fn matches(&self, stock: i64) -> bool {
        match self {
            StockState::InStock => stock > LOW_STOCK_THRESHOLD,
            StockState::LowStock => stock > 0 && stock <= LOW_STOCK_THRESHOLD,
            StockState::OutOfStock => stock <= 0,
        }
    }
}

/// Immutable filter snapshot for one search session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilters {
    pub text: String,
    pub category: Option<String>,
    pub stock: Option<StockState>,
}

impl SearchFilters {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// An empty filter set means "nothing to search": blank text, no
    /// category, no stock constraint.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.category.is_none() && self.stock.is_none()
    }

    /// Apply the filter semantics locally.
    ///
    /// Matches the remote catalog's behavior closely enough for the
    /// offline fallback path: case-insensitive substring match of `text`
    /// over name and category, case-insensitive equality for the category
    /// filter, and the tri-state stock predicate.
    pub fn matches(&self, record: &ProductRecord) -> bool {
        let text = self.text.trim();
        if !text.is_empty()
            && !contains_ci(&record.name, text)
            && !contains_ci(&record.category, text)
        {
            return false;
        }

        if let Some(category) = &self.category {
            if record.category.to_lowercase() != category.to_lowercase() {
                return false;
            }
        }

        if let Some(stock) = self.stock {
            if !stock.matches(record.stock) {
                return false;
            }
        }

        true
    }
}

fn contains_ci(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// One page of catalog results.
///
/// `total` and `has_more` come from the data source at query time and are
/// advisory: the backend may mutate between pages, so neither is ever
/// asserted against the accumulated result length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPage {
    pub items: Vec<ProductRecord>,
    pub total: u64,
    pub has_more: bool,
}

impl ResultPage {
    /// A page holding everything the source had for the query.
    pub fn complete(items: Vec<ProductRecord>) -> Self {
        Self {
            total: items.len() as u64,
            has_more: false,
            items,
        }
    }

    pub fn empty() -> Self {
        Self::complete(Vec::new())
    }
}
