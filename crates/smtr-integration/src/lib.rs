//! `smtr-integration`: pushing prepared records to partner APIs.
//!
//! [`post_all`] fans payloads out behind a counting gate so no more than
//! `max_concurrent` requests are ever in flight, and reports one
//! [`PostOutcome`] per payload. [`payloads`] holds the request bodies built
//! from warehouse rows.

pub mod error;
pub mod gate;
pub mod payloads;

pub use error::{IntegrationError, Result};
pub use gate::{header_map, post_all, PostOutcome};
pub use payloads::{prepare_negativacao_payloads, NegativacaoPayload, Row};
