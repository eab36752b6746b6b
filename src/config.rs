use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::callgraph::{CallGraphMode, CallGraphOptions};
use crate::error::CpError;
use crate::transform::TransformOptions;

/// Handler methods for runtime-assert mode, written as
/// `Owner.name(descriptor)`.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RuntimeAssertHandlers {
    pub(crate) param: Option<String>,
    pub(crate) field: Option<String>,
    #[serde(rename = "return")]
    pub(crate) return_value: Option<String>,
}

/// Analysis configuration. Every field has a default, so a config file only
/// needs to name what it changes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// Refinement rounds after the first whole-program pass.
    pub(crate) max_heap_analysis_iterations: usize,
    /// Lowest platform level the output must run on.
    pub(crate) min_sdk: u32,
    pub(crate) replace_moves_with_consts: bool,
    pub(crate) create_runtime_asserts: bool,
    pub(crate) use_multiple_callee_callgraph: bool,
    /// Treat every keep method as a call-graph entry, called or not.
    pub(crate) keep_methods_are_entries: bool,
    pub(crate) runtime_assert_handlers: RuntimeAssertHandlers,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_heap_analysis_iterations: 4,
            min_sdk: 21,
            replace_moves_with_consts: true,
            create_runtime_asserts: false,
            use_multiple_callee_callgraph: false,
            keep_methods_are_entries: true,
            runtime_assert_handlers: RuntimeAssertHandlers::default(),
        }
    }
}

impl Config {
    /// Read a JSON config file; errors name the offending JSON path.
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut deserializer = serde_json::Deserializer::from_reader(BufReader::new(file));
        serde_path_to_error::deserialize(&mut deserializer)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Reject configurations the requested mode cannot run with.
    pub(crate) fn validate(&self) -> Result<(), CpError> {
        if !self.create_runtime_asserts {
            return Ok(());
        }
        let handlers = &self.runtime_assert_handlers;
        for (role, handler) in [
            ("param", &handlers.param),
            ("field", &handlers.field),
            ("return", &handlers.return_value),
        ] {
            if handler.is_none() {
                return Err(CpError::ConfigMissing(format!(
                    "runtime asserts need a {role} handler"
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn call_graph_options(&self) -> CallGraphOptions {
        CallGraphOptions {
            mode: if self.use_multiple_callee_callgraph {
                CallGraphMode::MultipleCallee
            } else {
                CallGraphMode::SingleCallee
            },
            keep_methods_are_entries: self.keep_methods_are_entries,
        }
    }

    pub(crate) fn transform_options(&self) -> TransformOptions {
        TransformOptions {
            replace_moves_with_consts: self.replace_moves_with_consts,
        }
    }
}
