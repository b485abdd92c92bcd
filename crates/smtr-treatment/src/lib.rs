//! `smtr-treatment`: materialization of captured data with dbt.
//!
//! A [`DbtSelector`] names a dbt selector and the captured tables or other
//! selectors it reads. Each run resolves a [`MaterializationWindow`] from
//! the last successful run kept in the [`StateStore`], checks that every
//! input covers the window, then invokes `dbt run` through the
//! [`DbtRunner`] and, when due, the selector's post-run tests.

pub mod dbt;
pub mod error;
pub mod materialize;
pub mod selector;
pub mod state;
pub mod window;

pub use dbt::{DbtCommand, DbtOutput, DbtRunner};
pub use error::{Result, TreatmentError};
pub use materialize::{MaterializationReport, MaterializeRequest, Materializer};
pub use selector::{build_selectors, DataSource, DbtSelector, DbtTest};
pub use state::StateStore;
pub use window::{find_input_gaps, InputGaps, MaterializationWindow, StoreResolver};
