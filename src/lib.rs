//! # Signal Compiler
//!
//! Compiles one component (state declarations, handlers, markup tree) into a JavaScript
//! module that builds its DOM once and then updates individual nodes from signal
//! subscriptions. No virtual DOM, no subtree re-rendering.
//!
//! ## Pipeline
//!
//! 1. **Analyze** (`analyze`): resolve every identifier, compute the dependency set of each
//!    markup site, collect handler read/write sets. All errors of a component are reported
//!    together; any error means no output for that component.
//! 2. **Plan** (`plan`): split the tree into fragments (root, conditional branches, loop
//!    items) and give every node that is touched after `create()` a slot.
//! 3. **Generate** (`codegen`): structured `create` / `mount` / update programs per fragment.
//! 4. **Wire** (`wiring`): one subscription per state for the whole component, re-running
//!    exactly the update callbacks of the live slots that read it.
//! 5. **Emit** (`codegen::emit_module`): deterministic module text.
//!
//! ## Generated Code Invariants
//!
//! 1. **Explicit context**: fragments receive `ctx = { state, handlers, locals }` and never
//!    capture component state lexically.
//! 2. **Qualification**: `count` → `ctx.state.count.value`, loop variable `item` →
//!    `ctx.locals.item.value`, handler `inc` → `ctx.handlers.inc`.
//! 3. **Static sites**: a site with an empty dependency set is written once in `create()`
//!    and never again.
//! 4. **Determinism**: identical input produces byte-identical output.

#[cfg(feature = "napi")]
use napi_derive::napi;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

pub mod analyze;
pub mod ast;
pub mod cache;
pub mod codegen;
pub mod error;
pub mod plan;
mod renamer;
pub mod scope;
pub mod static_eval;
pub mod visitor;
pub mod wiring;

#[cfg(test)]
mod runtime_sim;

pub use ast::ComponentDefinition;
pub use cache::CompileCache;
pub use codegen::ComponentProgram;
pub use error::{CompileFailure, CompilerError, ErrorKind};
pub use wiring::Wiring;

use crate::analyze::analyze_component;
use crate::codegen::{emit_module, generate_program};
use crate::plan::plan_component;
use crate::visitor::NodeCensus;
use crate::wiring::wire_component;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct CompileOptions {
    /// Import source of the `signal` factory
    pub runtime_module: String,
    pub emit_header: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            runtime_module: "@preact/signals-core".to_string(),
            emit_header: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledModule {
    pub component: String,
    pub code: String,
    /// sha256 hex of the compile request
    pub fingerprint: String,
    pub program: ComponentProgram,
    pub wiring: Wiring,
}

/// Result of a batch build, in input order.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub modules: Vec<CompiledModule>,
    pub failures: Vec<CompileFailure>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

pub fn compile_component(
    component: &ComponentDefinition,
    options: &CompileOptions,
) -> Result<CompiledModule, CompileFailure> {
    let fingerprint = cache::fingerprint(component, options);
    compile_fingerprinted(component, options, fingerprint)
}

pub(crate) fn compile_fingerprinted(
    component: &ComponentDefinition,
    options: &CompileOptions,
    fingerprint: String,
) -> Result<CompiledModule, CompileFailure> {
    let census = NodeCensus::of(component);
    log::debug!(
        "compiling `{}`: {} element(s), {} text(s), {} expression(s), {} conditional(s), {} loop(s)",
        component.name,
        census.elements,
        census.texts,
        census.expressions,
        census.conditionals,
        census.loops
    );

    let analysis = analyze_component(component).map_err(|errors| CompileFailure::new(&component.name, errors))?;
    let plan = plan_component(&analysis)
        .map_err(|error| CompileFailure::new(&component.name, vec![error.in_file(&component.file_path)]))?;
    let program = generate_program(&analysis, &plan);
    let wiring = wire_component(&program);
    let code = emit_module(&program, &wiring, options, &fingerprint);

    Ok(CompiledModule {
        component: component.name.clone(),
        code,
        fingerprint,
        program,
        wiring,
    })
}

/// Compile independent components in parallel. A failing component never stops the
/// others; every failure is reported.
pub fn compile_components(components: &[ComponentDefinition], options: &CompileOptions) -> BatchReport {
    let results: Vec<Result<CompiledModule, CompileFailure>> = components
        .par_iter()
        .map(|component| compile_component(component, options))
        .collect();

    let mut report = BatchReport::default();
    for result in results {
        match result {
            Ok(module) => report.modules.push(module),
            Err(failure) => report.failures.push(failure),
        }
    }
    if !report.is_success() {
        log::debug!(
            "batch finished: {} compiled, {} failed",
            report.modules.len(),
            report.failures.len()
        );
    }
    report
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NativeOutput {
    code: Option<String>,
    errors: Vec<CompilerError>,
}

/// JSON-in, JSON-out entry for JavaScript hosts: `{ code, errors }`.
pub fn compile_component_json(component_json: &str, options_json: Option<&str>) -> Result<String, String> {
    let component: ComponentDefinition =
        serde_json::from_str(component_json).map_err(|e| format!("Invalid component: {}", e))?;
    let options: CompileOptions = match options_json {
        Some(json) => serde_json::from_str(json).map_err(|e| format!("Invalid options: {}", e))?,
        None => CompileOptions::default(),
    };

    let output = match compile_component(&component, &options) {
        Ok(module) => NativeOutput {
            code: Some(module.code),
            errors: Vec::new(),
        },
        Err(failure) => NativeOutput {
            code: None,
            errors: failure.errors,
        },
    };
    serde_json::to_string(&output).map_err(|e| e.to_string())
}

#[cfg(feature = "napi")]
#[napi]
pub fn compile_component_native(component_json: String, options_json: Option<String>) -> napi::Result<String> {
    compile_component_json(&component_json, options_json.as_deref()).map_err(napi::Error::from_reason)
}
