//! Textual patching of the application's minified main script.
//!
//! The script is not parsed. The patch relies on anchors: exact snippets of
//! the minified source that are known to exist in the supported application
//! version. Each anchor is replaced with a text derived from it. When the
//! application changes shape, only the anchors need to be updated.

use super::{PatchError, Result};

/// Token proving a script has already been patched.
pub const PATCH_MARKER: &str = "/*reskin:patched*/";
/// Name of the injected helper that applies the stylesheet to a window.
pub const HELPER_NAME: &str = "__reskinApply";
const CSS_VARIABLE_NAME: &str = "__reskinCss";

/// A snippet to look for and a function producing its replacement from the
/// matched text.
pub struct Anchor {
    pub name: String,
    pub search: String,
    pub replace: Box<dyn Fn(&str) -> String>,
}

impl Anchor {
    pub fn new<F>(name: impl Into<String>, search: impl Into<String>, replace: F) -> Self
    where
        F: Fn(&str) -> String + 'static,
    {
        Self {
            name: name.into(),
            search: search.into(),
            replace: Box::new(replace),
        }
    }
}

/// Describes where and how the helper is inserted into the script.
pub trait AnchorStrategy {
    /// Anchors to apply, in order, given the helper's definition.
    fn anchors(&self, helper_definition: &str) -> Vec<Anchor>;

    /// Call expression that must appear in a patched script.
    fn helper_invocation(&self) -> String;
}

/// Anchors made of two literal snippets: a statement after which the helper
/// is defined, and a window construction statement after which the helper is
/// called on `window`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralAnchors {
    pub definition: String,
    pub call_site: String,
    pub window: String,
}

impl Default for LiteralAnchors {
    fn default() -> Self {
        Self {
            definition: r#"const{app:a,BrowserWindow:B}=require("electron");"#.to_string(),
            call_site: "M=new B(W);".to_string(),
            window: "M".to_string(),
        }
    }
}

impl AnchorStrategy for LiteralAnchors {
    fn anchors(&self, helper_definition: &str) -> Vec<Anchor> {
        let helper_definition = helper_definition.to_string();
        let invocation = self.helper_invocation();
        vec![
            Anchor::new("helper definition", self.definition.as_str(), move |found| {
                format!("{}{}", found, helper_definition)
            }),
            Anchor::new("window creation", self.call_site.as_str(), move |found| {
                format!("{}{};", found, invocation)
            }),
        ]
    }

    fn helper_invocation(&self) -> String {
        format!("{}({})", HELPER_NAME, self.window)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Patched(String),
    AlreadyPatched,
}

pub struct PatchEngine {
    css: String,
    strategy: Box<dyn AnchorStrategy>,
}

impl PatchEngine {
    pub fn new(css: impl Into<String>, strategy: Box<dyn AnchorStrategy>) -> Self {
        Self {
            css: css.into(),
            strategy,
        }
    }

    pub fn is_already_patched(text: &str) -> bool {
        text.contains(PATCH_MARKER)
    }

    /// Patches `text`, or reports it as already patched.
    ///
    /// Fails without producing anything if an anchor cannot be found or if
    /// the result does not carry the marker and a helper call.
    pub fn apply_patch(&self, text: &str) -> Result<PatchOutcome> {
        if Self::is_already_patched(text) {
            return Ok(PatchOutcome::AlreadyPatched);
        }
        let helper_definition = self.helper_definition();
        // Anchors are located in the original text only, never in inserted code
        let mut matches = Vec::new();
        for anchor in self.strategy.anchors(&helper_definition) {
            if anchor.search.is_empty() {
                return Err(PatchError::AnchorNotFound(format!(
                    "{} (empty anchor)",
                    anchor.name
                )));
            }
            let start = text
                .find(anchor.search.as_str())
                .ok_or_else(|| PatchError::AnchorNotFound(anchor.name.clone()))?;
            log::trace!("Anchor '{}' found at byte {}", anchor.name, start);
            matches.push((start, start + anchor.search.len(), anchor));
        }
        matches.sort_by_key(|(start, _, _)| *start);
        for pair in matches.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(PatchError::PatchVerification(format!(
                    "anchors '{}' and '{}' overlap",
                    pair[0].2.name, pair[1].2.name
                )));
            }
        }
        let mut patched = text.to_string();
        for (start, end, anchor) in matches.iter().rev() {
            let replacement = (anchor.replace)(&anchor.search);
            patched.replace_range(*start..*end, &replacement);
        }
        self.verify(&patched, &helper_definition)?;
        Ok(PatchOutcome::Patched(patched))
    }

    fn verify(&self, patched: &str, helper_definition: &str) -> Result<()> {
        if !Self::is_already_patched(patched) {
            return Err(PatchError::PatchVerification(
                "patch marker is missing".to_string(),
            ));
        }
        // The call must appear outside of the helper's own definition
        let invocation = self.strategy.helper_invocation();
        let call_count = patched.matches(invocation.as_str()).count();
        let defined_count = helper_definition.matches(invocation.as_str()).count();
        if call_count <= defined_count {
            return Err(PatchError::PatchVerification(format!(
                "'{}' is never called",
                invocation
            )));
        }
        Ok(())
    }

    /// Builds the code inserted after the definition anchor. The stylesheet is
    /// embedded as a JSON string, which is a valid JS string literal.
    fn helper_definition(&self) -> String {
        let css_literal = serde_json::Value::String(self.css.clone()).to_string();
        format!(
            concat!(
                ";{marker}const {css}={literal};",
                "function {helper}(w){{try{{",
                "const c=w.webContents,i=()=>{{c.insertCSS({css}).catch(()=>{{}})}};",
                "c.isLoading()?c.once(\"did-finish-load\",i):i()",
                "}}catch(e){{}}}}"
            ),
            marker = PATCH_MARKER,
            css = CSS_VARIABLE_NAME,
            literal = css_literal,
            helper = HELPER_NAME,
        )
    }
}
