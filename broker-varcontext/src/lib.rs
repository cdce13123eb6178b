//! Variable resolution for service operations.
//!
//! A [`ContextBuilder`] merges configuration from several sources in a fixed
//! order and evaluates `${...}` templates against what has been merged so far.
//! The result is an immutable [`VarContext`].
//!
//! ```
//! use broker_varcontext::{ContextBuilder, DefaultVariable};
//!
//! let vc = ContextBuilder::new()
//!     .merge_default_with_eval(&[
//!         DefaultVariable::new("a", "a"),
//!         DefaultVariable::new("b", "${a}"),
//!     ])
//!     .build()
//!     .unwrap();
//! assert_eq!(vc.get_string("b").as_deref(), Some("a"));
//! ```

pub mod builder;
pub mod cast;
pub mod context;
pub mod error;
pub mod eval;
pub mod validation;
pub mod variable;

pub use builder::ContextBuilder;
pub use context::VarContext;
pub use error::{Result, VarContextError};
pub use validation::FieldError;
pub use variable::{DefaultVariable, VarType};
