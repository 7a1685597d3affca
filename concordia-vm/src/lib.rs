//! The Concordia runtime: loads a compiled IL image (`concordia-asm`) and
//! interprets it, in either direction, against an application-supplied
//! [`IoCallback`].
//!
//! ```text
//! let program = Program::load(&image_bytes)?;
//! let mut ctx = VmContext::init(Mode::Decode, &mut buf, Limits::default());
//! ctx.execute(&program, &mut my_callback)?;
//! ```

#![warn(missing_docs)]

mod callback;
mod cursor;
mod error;
mod expr;
mod interpreter;
mod limits;
mod program;
mod state;
mod transform;

pub use callback::{CallbackCtx, IoCallback, Mode, OpType, ScalarValue, StringFraming};
pub use cursor::Cursor;
pub use error::ConcordiaError;
pub use expr::{eval as eval_expr, CtxLookup, Value};
pub use interpreter::VmContext;
pub use limits::Limits;
pub use program::Program;
pub use state::VmState;
pub use transform::Transform;
