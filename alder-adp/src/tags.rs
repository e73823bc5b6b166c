//! Registered server-side tags.
//!
//! A tag maps to a script, a procedure, or an ADP fragment. Tags with no
//! end tag expand where they appear; tags with an end tag capture the
//! enclosed body and hand it to the expansion. The registry is consulted
//! under a reader lock on every parse.

use std::collections::HashMap;
use std::sync::Arc;

use alder_base::RwLock;

/// How a registered tag's content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// Content is a procedure name invoked with the attributes.
    Proc,
    /// Content is a script evaluated as-is.
    Script,
    /// Content is an ADP fragment parsed and evaluated.
    Adp,
}

#[derive(Debug)]
pub struct TagDef {
    pub tag: String,
    pub endtag: Option<String>,
    pub content: String,
    pub kind: TagKind,
}

/// Server-wide tag table.
pub struct TagRegistry {
    tags: RwLock<HashMap<String, Arc<TagDef>>>,
}

impl TagRegistry {
    pub fn new() -> Self {
        TagRegistry {
            tags: RwLock::with_name("adp:tags", HashMap::new()),
        }
    }

    /// Register or replace a tag. Names are matched case-insensitively.
    pub fn register(&self, tag: &str, endtag: Option<&str>, content: &str, kind: TagKind) {
        let def = Arc::new(TagDef {
            tag: tag.to_lowercase(),
            endtag: endtag.map(str::to_lowercase),
            content: content.to_string(),
            kind,
        });
        self.tags.write().insert(def.tag.clone(), def);
    }

    pub fn lookup(&self, tag: &str) -> Option<Arc<TagDef>> {
        self.tags.read().get(tag).cloned()
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        TagRegistry::new()
    }
}

/// Quote a string as a single list element of a composed script.
pub(crate) fn append_element(script: &mut String, element: &str) {
    if !script.is_empty() && !script.ends_with([' ', '[']) {
        script.push(' ');
    }
    script.push('{');
    script.push_str(element);
    script.push('}');
}
