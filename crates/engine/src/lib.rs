//! kpolicy engine: decides which generate rules of a policy apply to a newly created
//! Namespace and creates the declared ConfigMaps and Secrets inside it.
//!
//! Scope is deliberately narrow: only `Namespace` triggers are processed and only
//! ConfigMap/Secret generators are dispatched.

#![forbid(unsafe_code)]

pub mod generation;
pub mod matcher;
pub mod observer;

pub use generation::{dispatch, generate, GenerationResponse, TRIGGER_KIND};
pub use matcher::{matches, parse_name};
pub use observer::{GenerationObserver, Outcome, RuleEvent, TracingObserver};
