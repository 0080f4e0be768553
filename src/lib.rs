//! Incremental, grammar-driven lexical highlighting engine.
//!
//! A grammar is a set of named contexts, each holding an ordered list of
//! matching rules. The engine walks a text buffer one line at a time,
//! keeping a persistent stack of active contexts per line so edits only
//! re-parse the lines whose state actually changed, and yields back to
//! the host whenever the per-chunk time budget runs out.

pub mod buffer;
pub mod grammar;
pub mod loader;
pub mod matcher;
pub mod parser;
pub mod scheduler;
pub mod stack;

pub use buffer::{Buffer, EditNotice};
pub use grammar::{AttrClass, AttrId, GrammarStore, RuleSet};
pub use parser::{parse_line, ParsedLine, Span};
pub use scheduler::{Budgets, Highlighter, HostHooks, LineSource, NullHooks};
pub use stack::ContextStack;
