//! `almacen-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives shared by the data-access
//! layer and any embedding shell (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod product;

pub use error::{DomainError, DomainResult};
pub use id::ProductId;
pub use product::{ProductRecord, ResultPage, SearchFilters, StockState};
