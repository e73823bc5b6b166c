//! Single-pass template parser.
//!
//! Scans for four kinds of embedded script sequences:
//!
//! 1. `<% script %>` and `<%= expression %>`, with balanced nesting
//! 2. `<script runat=server ...> script </script>`
//! 3. `<registered-tag a=v>`
//! 4. `<registered-start-tag a=v> body </registered-end-tag>`
//!
//! Everything else is literal text. HTML-ish tags are parsed permissively;
//! a `>` inside a quoted attribute value does not end the tag, and inputs
//! that do not look like a well-formed start tag fall back to the first
//! plain `>`.

use std::sync::Arc;

use crate::code::{AdpCode, AdpFlags, BlockKind};
use crate::tags::{append_element, TagDef, TagRegistry};

/// Builtin invoked to append a value to the page output.
const APPEND: &str = "adp_append ";

/// Control script emitted once for `<script ... stream=on>`.
const STREAM_ON: &str = "adp_ctl stream on";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    TagNext,
    TagInlineCode,
    TagScript,
    TagReg,
}

/// Parse a template (or pure script file) into executable blocks.
pub fn parse(registry: &TagRegistry, source: &str, flags: AdpFlags, file: &str) -> AdpCode {
    if flags.tclfile {
        parse_script_file(source, flags, file)
    } else {
        Parser::new(registry, source, flags).run()
    }
}

/// Pure-script files become one script block. Under result caching the
/// source is wrapped so repeated execution hits a single proc call.
fn parse_script_file(source: &str, flags: AdpFlags, file: &str) -> AdpCode {
    let mut code = AdpCode::default();
    if flags.cache {
        let wrapped = format!(
            "if {{[info proc adp:{file}] == {{}}}} {{ proc adp:{file} {{}} {{{source}}} }}\nadp:{file}"
        );
        code.push_block(BlockKind::Script, &wrapped, 0);
    } else {
        code.push_block(BlockKind::Script, source, 0);
    }
    code
}

struct Parser<'a> {
    registry: &'a TagRegistry,
    src: &'a str,
    flags: AdpFlags,
    code: AdpCode,
    /// Fused script accumulated in single mode.
    single: String,
    line: u32,
    stream_done: bool,
}

impl<'a> Parser<'a> {
    fn new(registry: &'a TagRegistry, src: &'a str, flags: AdpFlags) -> Self {
        Parser {
            registry,
            src,
            flags,
            code: AdpCode::default(),
            single: String::new(),
            line: 0,
            stream_done: false,
        }
    }

    fn run(mut self) -> AdpCode {
        let bytes = self.src.as_bytes();
        let mut state = State::TagNext;
        let mut text = 0usize;
        let mut adp = 0usize;
        let mut level = 0i32;
        // Script-tag bookkeeping.
        let mut script_start = 0usize;
        let mut script_stream = false;
        // Registered-tag bookkeeping.
        let mut cur_tag: Option<Arc<TagDef>> = None;
        let mut attr_range = (0usize, 0usize);

        loop {
            let Some(s) = find_byte(bytes, adp, b'<') else {
                break;
            };

            match state {
                State::TagInlineCode => {
                    // Find the %> matching this <%, skipping nested pairs.
                    let Some(mut e) = find_str(self.src, s, "%>") else {
                        break;
                    };
                    let mut balanced = true;
                    let mut n = s + 2;
                    loop {
                        match find_str(self.src, n, "<%") {
                            Some(open) if open < e => {
                                n = open + 2;
                                match find_str(self.src, e + 2, "%>") {
                                    Some(next_close) => e = next_close,
                                    None => {
                                        balanced = false;
                                        break;
                                    }
                                }
                            }
                            _ => break,
                        }
                    }
                    if !balanced {
                        // No matching close; emit the text and the dangling
                        // opener, then keep scanning after it.
                        self.append(text, s + 2, BlockKind::Text);
                        text = s + 2;
                    } else {
                        if s > text {
                            self.append(text, s, BlockKind::Text);
                        }
                        if !self.flags.safe {
                            if bytes.get(s + 2) == Some(&b'=') {
                                self.append(s + 3, e, BlockKind::AppendScript);
                            } else {
                                self.append(s + 2, e, BlockKind::Script);
                            }
                        }
                        text = e + 2;
                    }
                    state = State::TagNext;
                    adp = text;
                }

                State::TagNext => {
                    if bytes.get(s + 1) == Some(&b'%') && bytes.get(s + 2) != Some(&b'>') {
                        state = State::TagInlineCode;
                        continue;
                    }
                    match bytes.get(s + 1) {
                        Some(c) if c.is_ascii_alphanumeric() => {}
                        _ => {
                            adp = s + 1;
                            continue;
                        }
                    }
                    let Some(e) = parse_tag_end(self.src, s) else {
                        break;
                    };
                    let (tag, attr_start) = get_tag(self.src, s, e);
                    let server_script = tag == "script" && {
                        let atts = parse_atts(&self.src[attr_start..e]);
                        if is_server_script(&atts) {
                            self.append(text, s, BlockKind::Text);
                            script_start = e + 1;
                            script_stream = has_att(&atts, "stream", "on");
                            state = State::TagScript;
                            level = 1;
                            true
                        } else {
                            false
                        }
                    };
                    if server_script {
                        // Body handled in the script state.
                    } else if let Some(def) = self.registry.lookup(&tag) {
                        if s > text {
                            self.append(text, s, BlockKind::Text);
                        }
                        if def.endtag.is_none() {
                            self.append_tag(&def, (attr_start, e), None);
                            text = e + 1;
                        } else {
                            attr_range = (attr_start, e);
                            cur_tag = Some(def);
                            level = 1;
                            state = State::TagReg;
                        }
                    }
                    adp = s + tag.len() + 1;
                }

                State::TagScript => {
                    let Some(e) = find_byte(bytes, s, b'>') else {
                        break;
                    };
                    let (tag, _) = get_tag(self.src, s, e);
                    if tag == "script" {
                        level += 1;
                    } else if tag == "/script" {
                        level -= 1;
                        if level == 0 {
                            if !self.flags.safe {
                                if script_stream && !self.stream_done {
                                    self.append_script_text(STREAM_ON);
                                    self.stream_done = true;
                                }
                                self.append(script_start, s, BlockKind::Script);
                            }
                            text = e + 1;
                            state = State::TagNext;
                        }
                    }
                    adp = s + tag.len() + 1;
                }

                State::TagReg => {
                    let Some(e) = find_byte(bytes, s, b'>') else {
                        break;
                    };
                    let (tag, _) = get_tag(self.src, s, e);
                    let def = cur_tag.as_ref().map(Arc::clone).unwrap_or_else(|| unreachable!());
                    if tag == def.tag {
                        level += 1;
                        adp = s + tag.len() + 1;
                    } else if Some(tag.as_str()) == def.endtag.as_deref() {
                        level -= 1;
                        if level == 0 {
                            self.append_tag(&def, attr_range, Some((attr_range.1 + 1, s)));
                            text = e + 1;
                            state = State::TagNext;
                        }
                        adp = s + tag.len() + 2;
                    } else {
                        adp = s + 1;
                    }
                }
            }
        }

        // Trailing literal text.
        if text < self.src.len() {
            self.append(text, self.src.len(), BlockKind::Text);
        }

        if self.flags.single {
            let mut code = AdpCode::default();
            let fused = std::mem::take(&mut self.single);
            code.push_block(BlockKind::Script, &fused, 0);
            code
        } else {
            self.code
        }
    }

    /// Emit a source range as a block, tracking line numbers.
    fn append(&mut self, start: usize, end: usize, kind: BlockKind) {
        if end <= start {
            return;
        }
        let segment = &self.src[start..end];
        if self.flags.single {
            match kind {
                BlockKind::AppendScript => {
                    self.single.push_str(APPEND);
                    self.single.push_str(segment);
                }
                BlockKind::Text => {
                    self.single.push_str(APPEND);
                    append_element(&mut self.single, segment);
                }
                BlockKind::Script => self.single.push_str(segment),
            }
            self.single.push('\n');
            return;
        }

        let skip = kind == BlockKind::Text
            && self.flags.trimspace
            && segment.chars().all(char::is_whitespace);
        if !skip {
            self.code.push_block(kind, segment, self.line);
        }
        self.line += segment.matches('\n').count() as u32;
    }

    /// Emit a literal script not backed by the source text.
    fn append_script_text(&mut self, script: &str) {
        if self.flags.single {
            self.single.push_str(script);
            self.single.push('\n');
        } else {
            self.code.push_block(BlockKind::Script, script, self.line);
        }
    }

    /// Compose the invocation for a registered tag occurrence.
    fn append_tag(&mut self, def: &TagDef, atts: (usize, usize), body: Option<(usize, usize)>) {
        use crate::tags::TagKind;

        let atts_src = &self.src[atts.0..atts.1];
        let parsed = parse_atts(atts_src);

        let mut script = String::from("adp_append [");
        if def.kind == TagKind::Adp {
            script.push_str("adp_parse -- ");
        }
        append_element(&mut script, &def.content);
        if def.kind == TagKind::Proc {
            for (_, value) in &parsed {
                append_element(&mut script, value);
            }
        }
        if let Some((bs, be)) = body {
            if be > bs {
                append_element(&mut script, &self.src[bs..be]);
            }
        }
        if matches!(def.kind, TagKind::Script | TagKind::Adp) {
            script.push_str(" [tagset create");
            append_element(&mut script, &def.tag);
            for (name, value) in &parsed {
                append_element(&mut script, name);
                append_element(&mut script, value);
            }
            script.push(']');
        }
        script.push(']');
        self.append_script_text(&script);
    }
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..].iter().position(|&b| b == needle).map(|p| p + from)
}

fn find_str(src: &str, from: usize, needle: &str) -> Option<usize> {
    if from >= src.len() {
        return None;
    }
    src[from..].find(needle).map(|p| p + from)
}

/// Extract the lowercased tag name and the start of its attributes.
/// `s` points at `<`, `e` at the terminating `>`.
fn get_tag(src: &str, s: usize, e: usize) -> (String, usize) {
    let bytes = src.as_bytes();
    let mut i = s + 1;
    while i < e && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let name_start = i;
    while i < e && !bytes[i].is_ascii_whitespace() && bytes[i] != b'<' {
        i += 1;
    }
    let name = src[name_start..i].to_lowercase();
    while i < e && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    (name, i)
}

fn tag_valid_first(b: u8) -> bool {
    b.is_ascii_alphanumeric()
}

fn tag_valid(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b':' || b == b'_'
}

/// Find the `>` ending the tag starting at `s`.
///
/// Quoted attribute values may contain `>`. When the input does not scan
/// as a well-formed start tag, fall back to the first bare `>`.
fn parse_tag_end(src: &str, s: usize) -> Option<usize> {
    let bytes = src.as_bytes();
    let legacy = || find_byte(bytes, s, b'>');

    let mut i = s + 1;
    if i >= bytes.len() || !tag_valid_first(bytes[i]) {
        return legacy();
    }
    i += 1;
    while i < bytes.len() && tag_valid(bytes[i]) {
        i += 1;
    }
    if i >= bytes.len() {
        return legacy();
    }
    if bytes[i] != b'>' && !bytes[i].is_ascii_whitespace() {
        return legacy();
    }
    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return legacy();
        }
        if bytes[i] == b'>' {
            return Some(i);
        }
        // Attribute name.
        if !tag_valid_first(bytes[i]) {
            return legacy();
        }
        i += 1;
        while i < bytes.len() && tag_valid(bytes[i]) {
            i += 1;
        }
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return legacy();
        }
        if bytes[i] == b'>' {
            return Some(i);
        }
        if bytes[i] != b'=' {
            return legacy();
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return legacy();
        }
        if bytes[i] == b'\'' || bytes[i] == b'"' {
            let quote = bytes[i];
            i += 1;
            loop {
                if i >= bytes.len() {
                    return legacy();
                }
                if bytes[i] == quote {
                    break;
                }
                i += 1;
            }
            i += 1;
        } else {
            if !tag_valid_first(bytes[i]) {
                return legacy();
            }
            i += 1;
            while i < bytes.len() && tag_valid(bytes[i]) {
                i += 1;
            }
        }
    }
}

/// Parse `name[=value]` attribute pairs; values may be quoted. A bare
/// name doubles as its own value.
fn parse_atts(src: &str) -> Vec<(String, String)> {
    let bytes = src.as_bytes();
    let e = bytes.len();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < e {
        while i < e && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= e {
            break;
        }
        let name_start = i;
        if bytes[i] == b'\'' || bytes[i] == b'"' {
            let quote = bytes[i];
            i += 1;
            while i < e && bytes[i] != quote {
                i += 1;
            }
            i = (i + 1).min(e);
        } else {
            while i < e && !bytes[i].is_ascii_whitespace() && bytes[i] != b'=' {
                i += 1;
            }
        }
        let name_end = i;
        while i < e && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let name = unquote_att(&src[name_start..name_end]);
        if i >= e || bytes[i] != b'=' {
            // Name doubles as value.
            out.push((name.clone(), name));
            continue;
        }
        i += 1;
        while i < e && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let value_start = i;
        if i < e && (bytes[i] == b'"' || bytes[i] == b'\'') {
            let quote = bytes[i];
            i += 1;
            while i < e && bytes[i] != quote {
                i += 1;
            }
            i = (i + 1).min(e);
        } else {
            while i < e && !bytes[i].is_ascii_whitespace() {
                i += 1;
            }
        }
        let value = unquote_att(&src[value_start..i]);
        out.push((name, value));
    }
    out
}

fn unquote_att(raw: &str) -> String {
    let raw = raw.trim();
    if raw.len() >= 2 {
        let first = raw.as_bytes()[0];
        if (first == b'"' || first == b'\'') && raw.as_bytes()[raw.len() - 1] == first {
            return raw[1..raw.len() - 1].to_string();
        }
    }
    raw.to_string()
}

fn has_att(atts: &[(String, String)], name: &str, value: &str) -> bool {
    atts.iter()
        .any(|(n, v)| n.eq_ignore_ascii_case(name) && v.eq_ignore_ascii_case(value))
}

/// A `<script>` tag runs server-side when marked `runat=server` and not
/// tagged with a foreign language.
fn is_server_script(atts: &[(String, String)]) -> bool {
    let runat = has_att(atts, "runat", "server");
    let foreign_language = atts
        .iter()
        .any(|(n, v)| n.eq_ignore_ascii_case("language") && !v.eq_ignore_ascii_case("tcl"));
    runat && !foreign_language
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::TagKind;

    fn parse_plain(src: &str) -> AdpCode {
        parse(&TagRegistry::new(), src, AdpFlags::default(), "test.adp")
    }

    fn kinds(code: &AdpCode) -> Vec<(BlockKind, String)> {
        code.blocks()
            .map(|(b, text)| (b.kind, text.to_string()))
            .collect()
    }

    #[test]
    fn inline_code_blocks() {
        let code = parse_plain("<html><% set x 5 %>X=<%= $x %></html>");
        assert_eq!(
            kinds(&code),
            vec![
                (BlockKind::Text, "<html>".to_string()),
                (BlockKind::Script, " set x 5 ".to_string()),
                (BlockKind::Text, "X=".to_string()),
                (BlockKind::AppendScript, " $x ".to_string()),
                (BlockKind::Text, "</html>".to_string()),
            ]
        );
        assert_eq!(code.nscripts(), 2);
    }

    #[test]
    fn nested_inline_code_balances() {
        let code = parse_plain("a<% outer {<% inner %>} tail %>b");
        assert_eq!(
            kinds(&code),
            vec![
                (BlockKind::Text, "a".to_string()),
                (BlockKind::Script, " outer {<% inner %>} tail ".to_string()),
                (BlockKind::Text, "b".to_string()),
            ]
        );
    }

    #[test]
    fn unbalanced_inline_keeps_the_opener_as_text() {
        let code = parse_plain("x<% no close");
        let blocks = kinds(&code);
        // Everything survives as literal text, opener included.
        let text: String = blocks.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(text, "x<% no close");
        assert!(blocks.iter().all(|(k, _)| *k == BlockKind::Text));
    }

    #[test]
    fn line_numbers_follow_the_source() {
        let code = parse_plain("line0\nline1<% s1 %>\n<% s2\ns2b %>tail");
        let scripts: Vec<(u32, String)> = code
            .blocks()
            .filter(|(b, _)| b.kind.is_script())
            .map(|(b, text)| (b.line, text.to_string()))
            .collect();
        assert_eq!(scripts[0], (1, " s1 ".to_string()));
        assert_eq!(scripts[1], (2, " s2\ns2b ".to_string()));
    }

    #[test]
    fn server_script_tag_body_is_one_block() {
        let code = parse_plain("a<script runat=server>puts hi</script>b");
        assert_eq!(
            kinds(&code),
            vec![
                (BlockKind::Text, "a".to_string()),
                (BlockKind::Script, "puts hi".to_string()),
                (BlockKind::Text, "b".to_string()),
            ]
        );
    }

    #[test]
    fn foreign_language_script_stays_text() {
        let code = parse_plain("a<script runat=server language=js>x</script>b");
        assert!(kinds(&code).iter().all(|(k, _)| *k == BlockKind::Text));
    }

    #[test]
    fn client_script_stays_text() {
        let code = parse_plain("<script>var x = 1;</script>");
        assert!(kinds(&code).iter().all(|(k, _)| *k == BlockKind::Text));
    }

    #[test]
    fn stream_attribute_emits_one_control_block() {
        let code = parse_plain(
            "<script runat=server stream=on>a</script><script runat=server stream=on>b</script>",
        );
        let scripts: Vec<String> = code
            .blocks()
            .filter(|(b, _)| b.kind.is_script())
            .map(|(_, t)| t.to_string())
            .collect();
        assert_eq!(scripts, vec![STREAM_ON.to_string(), "a".to_string(), "b".to_string()]);
    }

    #[test]
    fn safe_mode_suppresses_scripts() {
        let mut flags = AdpFlags::default();
        flags.safe = true;
        let code = parse(
            &TagRegistry::new(),
            "a<% evil %>b<script runat=server>more evil</script>c",
            flags,
            "t.adp",
        );
        assert_eq!(code.nscripts(), 0);
        let text: String = code.blocks().map(|(_, t)| t).collect();
        assert_eq!(text, "abc");
    }

    #[test]
    fn quoted_gt_does_not_end_a_tag() {
        let registry = TagRegistry::new();
        registry.register("widget", None, "render_widget", TagKind::Proc);
        let code = parse(
            &registry,
            "<widget label=\"a > b\">",
            AdpFlags::default(),
            "t.adp",
        );
        let scripts: Vec<String> = code
            .blocks()
            .filter(|(b, _)| b.kind.is_script())
            .map(|(_, t)| t.to_string())
            .collect();
        assert_eq!(scripts.len(), 1);
        assert!(scripts[0].contains("{a > b}"), "got {}", scripts[0]);
    }

    #[test]
    fn registered_tag_without_end_expands_in_place() {
        let registry = TagRegistry::new();
        registry.register("hello", None, "say_hello", TagKind::Proc);
        let code = parse(
            &registry,
            "x<hello who=world>y",
            AdpFlags::default(),
            "t.adp",
        );
        assert_eq!(
            kinds(&code),
            vec![
                (BlockKind::Text, "x".to_string()),
                (
                    BlockKind::Script,
                    "adp_append [{say_hello} {world}]".to_string()
                ),
                (BlockKind::Text, "y".to_string()),
            ]
        );
    }

    #[test]
    fn registered_pair_tag_captures_the_body() {
        let registry = TagRegistry::new();
        registry.register("box", Some("/box"), "render_box", TagKind::Script);
        let code = parse(
            &registry,
            "<box title=\"Hi\">body text</box>",
            AdpFlags::default(),
            "t.adp",
        );
        let scripts: Vec<String> = code
            .blocks()
            .filter(|(b, _)| b.kind.is_script())
            .map(|(_, t)| t.to_string())
            .collect();
        assert_eq!(scripts.len(), 1);
        let script = &scripts[0];
        assert!(script.starts_with("adp_append [{render_box}"), "got {script}");
        assert!(script.contains("{body text}"), "got {script}");
        assert!(script.contains("[tagset create {box} {title} {Hi}]"), "got {script}");
    }

    #[test]
    fn registered_pair_tag_nests() {
        let registry = TagRegistry::new();
        registry.register("box", Some("/box"), "render_box", TagKind::Script);
        let code = parse(
            &registry,
            "<box>outer <box>inner</box> tail</box>",
            AdpFlags::default(),
            "t.adp",
        );
        let scripts: Vec<String> = code
            .blocks()
            .filter(|(b, _)| b.kind.is_script())
            .map(|(_, t)| t.to_string())
            .collect();
        assert_eq!(scripts.len(), 1, "nesting folds into one invocation");
        assert!(scripts[0].contains("{outer <box>inner</box> tail}"), "got {}", scripts[0]);
    }

    #[test]
    fn single_mode_fuses_everything() {
        let mut flags = AdpFlags::default();
        flags.single = true;
        let code = parse(
            &TagRegistry::new(),
            "<html><% set x 5 %><%= $x %></html>",
            flags,
            "t.adp",
        );
        assert_eq!(code.nblocks(), 1);
        assert_eq!(code.nscripts(), 1);
        let (block, text) = code.blocks().next().unwrap();
        assert_eq!(block.kind, BlockKind::Script);
        let expected = "adp_append {<html>}\n set x 5 \nadp_append  $x \nadp_append {</html>}\n";
        assert_eq!(text, expected);
    }

    #[test]
    fn tclfile_mode_is_one_script_block() {
        let mut flags = AdpFlags::default();
        flags.tclfile = true;
        let code = parse(&TagRegistry::new(), "set a 1\nset b 2", flags, "init.tcl");
        assert_eq!(code.nblocks(), 1);
        assert_eq!(code.nscripts(), 1);
        let (block, text) = code.blocks().next().unwrap();
        assert_eq!(block.kind, BlockKind::Script);
        assert_eq!(text, "set a 1\nset b 2");

        flags.cache = true;
        let code = parse(&TagRegistry::new(), "set a 1", flags, "init.tcl");
        let (_, text) = code.blocks().next().unwrap();
        assert!(text.contains("proc adp:init.tcl"), "got {text}");
        assert!(text.ends_with("adp:init.tcl"), "got {text}");
    }

    #[test]
    fn trimspace_drops_blank_text_blocks() {
        let mut flags = AdpFlags::default();
        flags.trimspace = true;
        let code = parse(
            &TagRegistry::new(),
            "<% a %>\n   \n<% b %>",
            flags,
            "t.adp",
        );
        assert_eq!(code.nblocks(), 2);
        assert!(code.blocks().all(|(b, _)| b.kind.is_script()));
    }

    #[test]
    fn bare_percent_tag_is_text() {
        let code = parse_plain("100 <%> done");
        let text: String = code.blocks().map(|(_, t)| t).collect();
        assert_eq!(text, "100 <%> done");
    }
}
