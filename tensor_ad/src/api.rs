//! String API for tooling and FFI-adjacent use.
//!
//! Accepts and produces the IR's JSON wire form, with errors flattened to
//! strings at the boundary.

use tensor_ad_ir::Module;

use crate::diff::differentiate;

/// Differentiate `target` in a JSON-encoded module, returning the resulting
/// module as JSON.
pub fn differentiate_json_str(
    module_json: &str,
    target: &str,
    require_grads: Option<&[&str]>,
) -> Result<String, String> {
    let module = Module::from_json(module_json).map_err(|e| format!("parse error: {}", e))?;
    let out = differentiate(&module, target, require_grads)
        .map_err(|e| format!("differentiation error: {}", e))?;
    out.to_json().map_err(|e| format!("print error: {}", e))
}
