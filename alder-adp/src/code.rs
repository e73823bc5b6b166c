//! Parsed template representation.
//!
//! A template parses into one shared text buffer plus an ordered list of
//! blocks, each a byte range into that buffer with the source line it
//! started on. Script blocks count separately so per-evaluator compiled
//! handles can be indexed densely.

/// What a block contains and how its output is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Literal text copied to the output.
    Text,
    /// A script whose result is discarded.
    Script,
    /// A script whose result is appended to the output.
    AppendScript,
}

impl BlockKind {
    pub fn is_script(self) -> bool {
        !matches!(self, BlockKind::Text)
    }
}

/// One parsed block: a range into [`AdpCode::text`].
#[derive(Debug, Clone, Copy)]
pub struct Block {
    pub kind: BlockKind,
    pub start: usize,
    pub end: usize,
    /// Zero-based source line the block starts on.
    pub line: u32,
}

/// A parsed template ready for execution.
#[derive(Debug, Default, Clone)]
pub struct AdpCode {
    pub(crate) text: String,
    pub(crate) blocks: Vec<Block>,
    nscripts: usize,
}

impl AdpCode {
    pub fn nblocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn nscripts(&self) -> usize {
        self.nscripts
    }

    pub fn blocks(&self) -> impl Iterator<Item = (Block, &str)> {
        self.blocks
            .iter()
            .map(move |b| (*b, &self.text[b.start..b.end]))
    }

    pub fn block_text(&self, block: &Block) -> &str {
        &self.text[block.start..block.end]
    }

    /// Total byte size, for cache accounting.
    pub fn size(&self) -> usize {
        self.text.len() + self.blocks.len() * std::mem::size_of::<Block>()
    }

    pub(crate) fn push_block(&mut self, kind: BlockKind, text: &str, line: u32) {
        if text.is_empty() {
            return;
        }
        let start = self.text.len();
        self.text.push_str(text);
        if kind.is_script() {
            self.nscripts += 1;
        }
        self.blocks.push(Block {
            kind,
            start,
            end: self.text.len(),
            line,
        });
    }
}

/// Parse and execution options for one template.
///
/// The parse-relevant subset (`safe`, `single`, `cache`, `tclfile`,
/// `trimspace`) is part of a shared page's identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AdpFlags {
    /// Suppress inline and script blocks.
    pub safe: bool,
    /// Fuse all blocks into a single script.
    pub single: bool,
    /// Allow result caching.
    pub cache: bool,
    /// The source is a pure script file, not a template.
    pub tclfile: bool,
    /// Drop whitespace-only text blocks.
    pub trimspace: bool,
    /// Log each block before execution.
    pub trace: bool,
    /// Abort the frame on the first script error.
    pub strict: bool,
    /// Include the frame stack in rendered errors.
    pub detailerror: bool,
    /// Render script errors into the output.
    pub displayerror: bool,
    /// Honor result-cache expiration.
    pub expire: bool,
    /// Abort the whole page when a frame aborts.
    pub autoabort: bool,
    /// Treat the eval argument as a file.
    pub adpfile: bool,
}

impl AdpFlags {
    /// The subset that affects parsing and page identity.
    pub fn parse_key(&self) -> u8 {
        u8::from(self.safe)
            | u8::from(self.single) << 1
            | u8::from(self.cache) << 2
            | u8::from(self.tclfile) << 3
            | u8::from(self.trimspace) << 4
    }
}
