//! Script Engine Port
//!
//! Evaluates BSH events at the target.

use indexmap::IndexMap;

pub const SOURCE_NODE_ID: &str = "SOURCE_NODE_ID";
pub const TARGET_NODE_ID: &str = "TARGET_NODE_ID";

pub trait ScriptEngine: Send + Sync {
    /// Evaluate `script` with `variables` bound by name.
    fn eval(&self, script: &str, variables: &IndexMap<String, String>) -> Result<(), String>;
}
