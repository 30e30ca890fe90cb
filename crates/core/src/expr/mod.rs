//! Sandboxed expression language used by `{{…}}` templates.
//!
//! A restricted JavaScript-style expression subset: literals, member
//! access, arithmetic, comparisons, ternary, and calls into a fixed
//! builtin table. Evaluation is a tree walk over the parsed AST against
//! an [`ExpressionContext`](crate::context::ExpressionContext); there is
//! no string compilation, no I/O, and no access to process globals.

mod builtins;
mod eval;
mod lexer;
mod parser;

pub use eval::Evaluated;

use crate::context::ExpressionContext;
use crate::error::GatewayError;

/// Source fragments rejected before parsing. The parser cannot produce
/// anything dangerous from them anyway, but rejecting early gives a
/// clear error for configs written against the upstream rule engine.
const DENYLIST: [&str; 4] = ["process.exit", "require(", "eval(", "Function("];

#[derive(Debug, thiserror::Error)]
pub enum ExprError {
    #[error("{0}")]
    Rejected(String),
    #[error("{0}")]
    Failed(String),
}

impl From<ExprError> for GatewayError {
    fn from(e: ExprError) -> Self {
        match e {
            ExprError::Rejected(msg) => GatewayError::ExpressionRejected(msg),
            ExprError::Failed(msg) => GatewayError::ExpressionFailed(msg),
        }
    }
}

/// Evaluate a single expression against the context.
pub fn evaluate(source: &str, ctx: &ExpressionContext) -> Result<Evaluated, ExprError> {
    for fragment in DENYLIST {
        if source.contains(fragment) {
            return Err(ExprError::Rejected(format!(
                "expression contains forbidden fragment '{fragment}'"
            )));
        }
    }
    let tokens = lexer::tokenize(source).map_err(ExprError::Failed)?;
    let ast = parser::parse(&tokens).map_err(ExprError::Failed)?;
    eval::eval(&ast, ctx).map_err(ExprError::Failed)
}
