use diff_match_patch_rs::{DiffMatchPatch, Compat, PatchInput, Efficient};

use crate::error::DiffError;

/// The two operations named by the spec's text diff/patch library
/// contract: `make_patch(old, new) -> patch_blob` and
/// `apply_patch(patch_blob, text) -> (patched_text, per_hunk_success)`.
/// All-hunks-true is required for success.
pub trait TextPatchTool {
    fn make_patch(&self, old_text: &str, new_text: &str) -> Result<String, DiffError>;
    fn apply_patch(&self, patch_blob: &str, text: &str) -> Result<(String, Vec<bool>), String>;
}

/// Real implementation backed by `diff-match-patch-rs`, a published Rust
/// port of Google's diff-match-patch algorithm family — the concrete,
/// real crate standing in for the spec's abstract "text diff/patch
/// library" collaborator.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffMatchPatchTool;

impl TextPatchTool for DiffMatchPatchTool {
    fn make_patch(&self, old_text: &str, new_text: &str) -> Result<String, DiffError> {
        let dmp = DiffMatchPatch::new();

        let diffs = dmp.diff_main::<Compat>(old_text, new_text)
            .map_err(|err| DiffError::TextPatch(Default::default(), format!("{err:?}")))?;

        let patches = dmp.patch_make(PatchInput::new_text_diffs(old_text, &diffs))
            .map_err(|err| DiffError::TextPatch(Default::default(), format!("{err:?}")))?;

        dmp.patch_to_text::<Efficient>(&patches)
            .map_err(|err| DiffError::TextPatch(Default::default(), format!("{err:?}")))
    }

    fn apply_patch(&self, patch_blob: &str, text: &str) -> Result<(String, Vec<bool>), String> {
        let dmp = DiffMatchPatch::new();

        let patches = dmp.patch_from_text::<Compat>(patch_blob)
            .map_err(|err| format!("{err:?}"))?;

        let (patched, applied) = dmp.patch_apply(&patches, text)
            .map_err(|err| format!("{err:?}"))?;

        Ok((patched, applied))
    }
}

/// Stand-in used by tests: the "patch blob" is just the new text verbatim,
/// and applying it always succeeds with a single, always-true hunk. Lets
/// `DiffEngine`/`MergeEngine` tests assert on control flow (classification,
/// hash checks, error propagation) without depending on the real
/// algorithm's exact diff output.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubTextPatchTool;

impl TextPatchTool for StubTextPatchTool {
    fn make_patch(&self, _old_text: &str, new_text: &str) -> Result<String, DiffError> {
        Ok(new_text.to_string())
    }

    fn apply_patch(&self, patch_blob: &str, _text: &str) -> Result<(String, Vec<bool>), String> {
        Ok((patch_blob.to_string(), vec![true]))
    }
}
