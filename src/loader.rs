//! Compiles a declarative TOML grammar description into the immutable
//! [`RuleSet`] the engine matches against. Rule-level problems (unknown
//! attribute, unknown context, missing field) never fail the load: the
//! offending piece is replaced with an inert default and reported through
//! the diagnostic channel, so one bad rule cannot take a language down.

use crate::grammar::{
    AttrClass, AttrId, Attribute, Context, ContextId, ContextSwitch, KeywordList, Rule,
    RuleKind, RuleSet, SwitchTarget,
};
use anyhow::{bail, Context as _, Result};
use once_cell::unsync::OnceCell;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct GrammarDef {
    name: String,
    #[serde(default)]
    extensions: Vec<String>,
    #[serde(default = "default_true")]
    case_sensitive: bool,
    #[serde(default)]
    delimiters: Option<String>,
    #[serde(default)]
    attributes: Vec<AttributeDef>,
    #[serde(default)]
    lists: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    contexts: Vec<ContextDef>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct AttributeDef {
    name: String,
    #[serde(default)]
    class: AttrClassDef,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum AttrClassDef {
    Code,
    String,
    Char,
    Comment,
    BlockComment,
    HereDoc,
    #[default]
    Other,
}

impl From<AttrClassDef> for AttrClass {
    fn from(def: AttrClassDef) -> Self {
        match def {
            AttrClassDef::Code => AttrClass::Code,
            AttrClassDef::String => AttrClass::String,
            AttrClassDef::Char => AttrClass::Char,
            AttrClassDef::Comment => AttrClass::Comment,
            AttrClassDef::BlockComment => AttrClass::BlockComment,
            AttrClassDef::HereDoc => AttrClass::HereDoc,
            AttrClassDef::Other => AttrClass::Other,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ContextDef {
    name: String,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    line_end: Option<String>,
    #[serde(default)]
    line_begin: Option<String>,
    #[serde(default)]
    fallthrough: Option<String>,
    #[serde(default)]
    dynamic: bool,
    #[serde(default)]
    rules: Vec<RuleDef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RuleDef {
    kind: RuleKindDef,
    #[serde(default)]
    char: Option<char>,
    #[serde(default)]
    chars: Option<String>,
    #[serde(default)]
    string: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    list: Option<String>,
    #[serde(default)]
    insensitive: bool,
    #[serde(default)]
    begin: Option<char>,
    #[serde(default)]
    end: Option<char>,
    #[serde(default)]
    marker: Option<char>,
    #[serde(default)]
    attribute: Option<String>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    look_ahead: bool,
    #[serde(default)]
    first_non_space: bool,
    #[serde(default)]
    dynamic: bool,
    #[serde(default)]
    column: Option<usize>,
    #[serde(default)]
    rules: Vec<RuleDef>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum RuleKindDef {
    DetectChar,
    Detect2Chars,
    AnyChar,
    StringDetect,
    WordDetect,
    Keyword,
    RegExpr,
    Int,
    Float,
    HlCOct,
    HlCHex,
    HlCChar,
    HlCStringChar,
    RangeDetect,
    LineContinue,
    DetectSpaces,
    DetectIdentifier,
    IncludeRules,
}

/// Name lookup tables built in a first pass over the definition.
struct Tables {
    grammar: String,
    attrs: HashMap<String, AttrId>,
    contexts: HashMap<String, ContextId>,
    lists: HashMap<String, usize>,
}

impl Tables {
    fn attr(&self, name: Option<&str>, what: &str) -> Option<AttrId> {
        let name = name?;
        match self.attrs.get(name) {
            Some(id) => Some(*id),
            None => {
                warn!(
                    grammar = %self.grammar,
                    attribute = name,
                    "unknown attribute in {what}, using context default"
                );
                None
            }
        }
    }

    /// Parse a context-switch specification: `#stay`, a chain of `#pop`s,
    /// optionally followed by `!Name`, a plain context name, or a
    /// `##grammar` cross-reference.
    fn switch(&self, spec: Option<&str>) -> ContextSwitch {
        let mut rest = match spec {
            Some(s) => s.trim(),
            None => return ContextSwitch::stay(),
        };
        if rest.is_empty() || rest == "#stay" {
            return ContextSwitch::stay();
        }
        let mut pops = 0;
        while let Some(r) = rest.strip_prefix("#pop") {
            pops += 1;
            rest = r;
        }
        let rest = rest.strip_prefix('!').unwrap_or(rest);
        let push = self.target(rest);
        ContextSwitch { pops, push }
    }

    fn target(&self, name: &str) -> Option<SwitchTarget> {
        if name.is_empty() {
            return None;
        }
        if let Some(grammar) = name.strip_prefix("##") {
            return Some(SwitchTarget::Grammar(grammar.to_string()));
        }
        match self.contexts.get(name) {
            Some(id) => Some(SwitchTarget::Context(*id)),
            None => {
                warn!(
                    grammar = %self.grammar,
                    context = name,
                    "unknown context in switch, treating as #stay"
                );
                None
            }
        }
    }
}

/// Load a grammar from TOML text. Only structural problems (bad TOML, no
/// contexts) are hard errors.
pub fn load_str(text: &str) -> Result<RuleSet> {
    let def: GrammarDef = toml::from_str(text).context("failed to parse grammar")?;
    if def.contexts.is_empty() {
        bail!("grammar '{}' defines no contexts", def.name);
    }

    // attribute 0 is always the implicit "Normal Text"
    let mut attributes = vec![Attribute {
        name: "Normal Text".to_string(),
        class: AttrClass::Code,
    }];
    for a in &def.attributes {
        attributes.push(Attribute {
            name: a.name.clone(),
            class: a.class.into(),
        });
    }

    let mut keyword_lists = Vec::new();
    let mut list_ids = HashMap::new();
    for (name, words) in &def.lists {
        list_ids.insert(name.clone(), keyword_lists.len());
        keyword_lists.push(KeywordList::new(name.clone(), words.clone(), def.case_sensitive));
    }

    let mut tables = Tables {
        grammar: def.name.clone(),
        attrs: HashMap::new(),
        contexts: HashMap::new(),
        lists: list_ids,
    };
    for (i, a) in attributes.iter().enumerate() {
        tables.attrs.entry(a.name.clone()).or_insert(AttrId(i as u16));
    }
    for (i, c) in def.contexts.iter().enumerate() {
        if tables
            .contexts
            .insert(c.name.clone(), ContextId(i as u32))
            .is_some()
        {
            warn!(grammar = %def.name, context = %c.name, "duplicate context name, later one shadowed");
        }
    }

    let contexts = def
        .contexts
        .iter()
        .map(|c| compile_context(c, &tables))
        .collect();

    Ok(RuleSet::new(
        def.name,
        def.extensions,
        contexts,
        attributes,
        keyword_lists,
        def.case_sensitive,
        def.delimiters,
    ))
}

pub fn load_file(path: &Path) -> Result<RuleSet> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read grammar file {}", path.display()))?;
    load_str(&text).with_context(|| format!("in grammar file {}", path.display()))
}

/// Load every `*.toml` grammar in a directory into the store. A file that
/// fails to load is reported and skipped; returns how many loaded.
pub fn load_dir(dir: &Path, store: &crate::grammar::GrammarStore) -> Result<usize> {
    let mut loaded = 0;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("failed to read grammar directory {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().map_or(true, |e| e != "toml") {
            continue;
        }
        match load_file(&path) {
            Ok(set) => {
                store.insert(set);
                loaded += 1;
            }
            Err(err) => warn!(path = %path.display(), error = %err, "skipping grammar"),
        }
    }
    Ok(loaded)
}

fn compile_context(def: &ContextDef, tables: &Tables) -> Context {
    let rules = def
        .rules
        .iter()
        .filter_map(|r| compile_rule(r, tables))
        .collect();
    Context {
        name: def.name.clone(),
        attribute: tables
            .attr(def.attribute.as_deref(), "context")
            .unwrap_or(AttrId(0)),
        rules,
        line_end: tables.switch(def.line_end.as_deref()),
        // independently configured; never derived from line-end
        line_begin: tables.switch(def.line_begin.as_deref()),
        fallthrough: def.fallthrough.as_deref().map(|s| tables.switch(Some(s))),
        dynamic: def.dynamic,
    }
}

fn compile_rule(def: &RuleDef, tables: &Tables) -> Option<Rule> {
    let kind = compile_kind(def, tables)?;
    Some(Rule {
        kind,
        attribute: tables.attr(def.attribute.as_deref(), "rule"),
        switch: tables.switch(def.context.as_deref()),
        look_ahead: def.look_ahead,
        first_non_space: def.first_non_space,
        dynamic: def.dynamic,
        column: def.column,
    })
}

/// A rule definition missing its required field is dropped (with a
/// diagnostic), which is the inert replacement the error policy asks for.
fn compile_kind(def: &RuleDef, tables: &Tables) -> Option<RuleKind> {
    let missing = |field: &str| -> Option<RuleKind> {
        warn!(grammar = %tables.grammar, kind = ?def.kind, field, "rule is missing required field, dropped");
        None
    };
    let kind = match def.kind {
        RuleKindDef::DetectChar => match def.char {
            Some(c) => RuleKind::DetectChar(c),
            None => return missing("char"),
        },
        RuleKindDef::Detect2Chars => {
            let mut chars = def.chars.as_deref().unwrap_or_default().chars();
            match (chars.next(), chars.next()) {
                (Some(a), Some(b)) => RuleKind::Detect2Chars(a, b),
                _ => return missing("chars"),
            }
        }
        RuleKindDef::AnyChar => match &def.chars {
            Some(s) if !s.is_empty() => RuleKind::AnyChar(s.chars().collect()),
            _ => return missing("chars"),
        },
        RuleKindDef::StringDetect => match &def.string {
            Some(s) => RuleKind::StringDetect {
                text: s.clone(),
                insensitive: def.insensitive,
            },
            None => return missing("string"),
        },
        RuleKindDef::WordDetect => match &def.string {
            Some(s) => RuleKind::WordDetect {
                word: s.clone(),
                insensitive: def.insensitive,
            },
            None => return missing("string"),
        },
        RuleKindDef::Keyword => {
            let name = match &def.list {
                Some(l) => l,
                None => return missing("list"),
            };
            match tables.lists.get(name) {
                Some(idx) => RuleKind::Keyword { list: *idx },
                None => {
                    warn!(grammar = %tables.grammar, list = %name, "unknown keyword list, rule dropped");
                    return None;
                }
            }
        }
        RuleKindDef::RegExpr => match &def.pattern {
            Some(p) => RuleKind::RegExpr {
                pattern: p.clone(),
                compiled: OnceCell::new(),
            },
            None => return missing("pattern"),
        },
        RuleKindDef::Int => RuleKind::Int {
            children: compile_children(def, tables),
        },
        RuleKindDef::Float => RuleKind::Float {
            children: compile_children(def, tables),
        },
        RuleKindDef::HlCOct => RuleKind::HlCOct,
        RuleKindDef::HlCHex => RuleKind::HlCHex,
        RuleKindDef::HlCChar => RuleKind::HlCChar,
        RuleKindDef::HlCStringChar => RuleKind::HlCStringChar,
        RuleKindDef::RangeDetect => match (def.begin, def.end) {
            (Some(begin), Some(end)) => RuleKind::RangeDetect { begin, end },
            _ => return missing("begin/end"),
        },
        RuleKindDef::LineContinue => RuleKind::LineContinue {
            marker: def.marker.unwrap_or('\\'),
        },
        RuleKindDef::DetectSpaces => RuleKind::DetectSpaces,
        RuleKindDef::DetectIdentifier => RuleKind::DetectIdentifier,
        RuleKindDef::IncludeRules => {
            let name = match &def.context {
                Some(c) => c.as_str(),
                None => return missing("context"),
            };
            match tables.target(name) {
                Some(target) => RuleKind::IncludeRules { target },
                None => return None,
            }
        }
    };
    Some(kind)
}

fn compile_children(def: &RuleDef, tables: &Tables) -> Vec<Rule> {
    def.rules
        .iter()
        .filter_map(|r| compile_rule(r, tables))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INI: &str = r##"
        name = "ini"
        extensions = ["ini", "cfg"]
        case-sensitive = false

        [[attributes]]
        name = "Section"
        class = "other"

        [[attributes]]
        name = "Comment"
        class = "comment"

        [lists]
        booleans = ["true", "false"]

        [[contexts]]
        name = "Normal"

        [[contexts.rules]]
        kind = "reg-expr"
        pattern = "^\\[.*\\]"
        attribute = "Section"

        [[contexts.rules]]
        kind = "detect-char"
        char = ";"
        attribute = "Comment"
        context = "CommentTail"
        first-non-space = true

        [[contexts.rules]]
        kind = "keyword"
        list = "booleans"
        attribute = "Section"

        [[contexts]]
        name = "CommentTail"
        attribute = "Comment"
        line-end = "#pop"
    "##;

    #[test]
    fn loads_a_complete_grammar() {
        let set = load_str(INI).unwrap();
        assert_eq!(set.name, "ini");
        assert_eq!(set.extensions, vec!["ini", "cfg"]);
        assert!(!set.case_sensitive);
        // implicit Normal Text plus the two declared attributes
        assert_eq!(set.attributes.len(), 3);
        assert_eq!(set.attr_by_name("Comment"), Some(AttrId(2)));
        assert_eq!(set.contexts.len(), 2);
        assert_eq!(set.context(ContextId(1)).line_end, ContextSwitch { pops: 1, push: None });

        let normal = set.context(ContextId(0));
        assert_eq!(normal.rules.len(), 3);
        assert!(normal.rules[1].first_non_space);
        assert_eq!(
            normal.rules[1].switch,
            ContextSwitch { pops: 0, push: Some(SwitchTarget::Context(ContextId(1))) }
        );
    }

    #[test]
    fn switch_specifications() {
        let set = load_str(
            r###"
            name = "sw"
            [[contexts]]
            name = "A"
            line-end = "#pop#pop!B"
            line-begin = "##Other"
            [[contexts]]
            name = "B"
            "###,
        )
        .unwrap();
        let a = set.context(ContextId(0));
        assert_eq!(
            a.line_end,
            ContextSwitch { pops: 2, push: Some(SwitchTarget::Context(ContextId(1))) }
        );
        assert_eq!(
            a.line_begin,
            ContextSwitch { pops: 0, push: Some(SwitchTarget::Grammar("Other".to_string())) }
        );
    }

    #[test]
    fn line_begin_is_independent_of_line_end() {
        let set = load_str(
            r#"
            name = "indep"
            [[contexts]]
            name = "A"
            line-end = "B"
            [[contexts]]
            name = "B"
            "#,
        )
        .unwrap();
        let a = set.context(ContextId(0));
        assert!(!a.line_end.is_stay());
        assert!(a.line_begin.is_stay());
    }

    #[test]
    fn soft_failures_degrade_instead_of_erroring() {
        let set = load_str(
            r#"
            name = "soft"
            [[contexts]]
            name = "Normal"
            attribute = "NoSuchAttr"

            [[contexts.rules]]
            kind = "detect-char"
            # missing char: dropped

            [[contexts.rules]]
            kind = "detect-char"
            char = "x"
            context = "NoSuchContext"

            [[contexts.rules]]
            kind = "keyword"
            list = "nope"
            "#,
        )
        .unwrap();
        let normal = set.context(ContextId(0));
        assert_eq!(normal.attribute, AttrId(0)); // fell back to default
        assert_eq!(normal.rules.len(), 1); // two rules dropped
        assert!(normal.rules[0].switch.is_stay()); // bad target became #stay
    }

    #[test]
    fn hard_failures_are_errors() {
        assert!(load_str("not toml at all [").is_err());
        assert!(load_str(r#"name = "empty""#).is_err());
    }

    #[test]
    fn numeric_children_compile() {
        let set = load_str(
            r#"
            name = "num"
            [[contexts]]
            name = "Normal"

            [[contexts.rules]]
            kind = "int"

            [[contexts.rules.rules]]
            kind = "any-char"
            chars = "uUlL"
            "#,
        )
        .unwrap();
        let rule = &set.context(ContextId(0)).rules[0];
        match &rule.kind {
            RuleKind::Int { children } => assert_eq!(children.len(), 1),
            other => panic!("expected Int, got {other:?}"),
        }
    }
}
