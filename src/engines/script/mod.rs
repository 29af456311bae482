//! The script engine: sandboxed scripts with an injected context namespace.

pub use self::context::ScriptContext;
pub use self::executor::{
	execute_endpoint_script,
	run_transform_script,
	run_validation_script,
};
pub use self::sandbox::ScriptError;

mod context;
mod executor;
mod sandbox;
