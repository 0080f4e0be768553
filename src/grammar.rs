use once_cell::unsync::OnceCell;
use regex::Regex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Word boundary characters used when a grammar does not override them.
pub const DEFAULT_DELIMITERS: &str = "\t .():!+,-<=>%&/;?[]^{|}~\\*";

/// Index into a rule set's attribute table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrId(pub u16);

/// Index into a rule set's context arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub u32);

/// Broad classification of an attribute, used by the query interface
/// (bracket matching, comment toggling) to ask "what kind of text is
/// at this position" without knowing the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrClass {
    Code,
    String,
    Char,
    Comment,
    BlockComment,
    HereDoc,
    Other,
}

/// A named formatting attribute. The engine only hands out attribute ids;
/// the host maps them to visual styling.
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub class: AttrClass,
}

/// Where a context switch lands after popping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchTarget {
    /// A context in the rule set that owns the switch.
    Context(ContextId),
    /// The default context of another grammar (`##name`), resolved
    /// lazily through the grammar store on first use.
    Grammar(String),
}

/// A context-switch specification: pop zero or more frames, then
/// optionally push a target context. `{ pops: 0, push: None }` is `#stay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextSwitch {
    pub pops: usize,
    pub push: Option<SwitchTarget>,
}

impl ContextSwitch {
    pub fn stay() -> Self {
        ContextSwitch { pops: 0, push: None }
    }

    pub fn is_stay(&self) -> bool {
        self.pops == 0 && self.push.is_none()
    }
}

/// A single matching rule inside a context.
#[derive(Debug)]
pub struct Rule {
    pub kind: RuleKind,
    /// Attribute applied to the matched text; `None` means the owning
    /// context's default attribute.
    pub attribute: Option<AttrId>,
    pub switch: ContextSwitch,
    /// Match without consuming text; only the context switch takes effect.
    pub look_ahead: bool,
    /// Only tried when everything left of the cursor is whitespace.
    pub first_non_space: bool,
    /// Pattern contains `%N` placeholders resolved from the captured data
    /// of the frame that pushed the current context.
    pub dynamic: bool,
    /// Only tried at exactly this column.
    pub column: Option<usize>,
}

/// The closed set of rule variants. One matching function per variant
/// lives in the matcher; adding a variant means adding an arm there.
#[derive(Debug)]
pub enum RuleKind {
    DetectChar(char),
    Detect2Chars(char, char),
    AnyChar(Vec<char>),
    StringDetect { text: String, insensitive: bool },
    WordDetect { word: String, insensitive: bool },
    Keyword { list: usize },
    RegExpr { pattern: String, compiled: OnceCell<Option<Regex>> },
    Int { children: Vec<Rule> },
    Float { children: Vec<Rule> },
    HlCOct,
    HlCHex,
    HlCChar,
    HlCStringChar,
    RangeDetect { begin: char, end: char },
    LineContinue { marker: char },
    DetectSpaces,
    DetectIdentifier,
    IncludeRules { target: SwitchTarget },
}

/// A named parsing state: an ordered rule list plus the switches applied
/// at line boundaries and when nothing matches.
#[derive(Debug)]
pub struct Context {
    pub name: String,
    /// Default attribute for text no rule claimed.
    pub attribute: AttrId,
    pub rules: Vec<Rule>,
    /// Applied repeatedly at end of line while it changes the stack.
    pub line_end: ContextSwitch,
    /// Applied once at start of line, unless the previous line ended in
    /// a line continuation.
    pub line_begin: ContextSwitch,
    /// Applied when no rule matched at the current column.
    pub fallthrough: Option<ContextSwitch>,
    /// Pushes of this context carry the captured data of the rule that
    /// pushed it (for `%N` substitution in its rules).
    pub dynamic: bool,
}

/// A named keyword list, stored pre-sorted for binary search. When the
/// grammar is case-insensitive the words are stored lowercased.
#[derive(Debug)]
pub struct KeywordList {
    pub name: String,
    words: Vec<String>,
}

impl KeywordList {
    pub fn new(name: String, mut words: Vec<String>, case_sensitive: bool) -> Self {
        if !case_sensitive {
            for w in &mut words {
                *w = w.to_lowercase();
            }
        }
        words.sort();
        words.dedup();
        KeywordList { name, words }
    }

    pub fn contains(&self, word: &str, case_sensitive: bool) -> bool {
        if case_sensitive {
            self.words.binary_search_by(|w| w.as_str().cmp(word)).is_ok()
        } else {
            let lowered = word.to_lowercase();
            self.words.binary_search(&lowered).is_ok()
        }
    }
}

/// The compiled, immutable representation of one grammar. Shared read-only
/// across every document highlighted with it; never mutated after loading.
#[derive(Debug)]
pub struct RuleSet {
    pub name: String,
    /// File extensions this grammar claims (for file-type detection).
    pub extensions: Vec<String>,
    pub contexts: Vec<Context>,
    pub default_context: ContextId,
    /// Attribute 0 is always the grammar's "normal text" attribute.
    pub attributes: Vec<Attribute>,
    pub keyword_lists: Vec<KeywordList>,
    pub case_sensitive: bool,
    delimiters: Vec<char>,
}

impl RuleSet {
    pub fn new(
        name: String,
        extensions: Vec<String>,
        contexts: Vec<Context>,
        attributes: Vec<Attribute>,
        keyword_lists: Vec<KeywordList>,
        case_sensitive: bool,
        delimiters: Option<String>,
    ) -> Self {
        let mut delimiters: Vec<char> = delimiters
            .as_deref()
            .unwrap_or(DEFAULT_DELIMITERS)
            .chars()
            .collect();
        delimiters.sort_unstable();
        delimiters.dedup();
        RuleSet {
            name,
            extensions,
            contexts,
            default_context: ContextId(0),
            attributes,
            keyword_lists,
            case_sensitive,
            delimiters,
        }
    }

    /// A grammar with no rules at all: one context, everything is normal
    /// text. Used as the fallback when no grammar claims a file.
    pub fn plain() -> Self {
        RuleSet::new(
            "None".to_string(),
            Vec::new(),
            vec![Context {
                name: "Normal".to_string(),
                attribute: AttrId(0),
                rules: Vec::new(),
                line_end: ContextSwitch::stay(),
                line_begin: ContextSwitch::stay(),
                fallthrough: None,
                dynamic: false,
            }],
            vec![Attribute {
                name: "Normal Text".to_string(),
                class: AttrClass::Code,
            }],
            Vec::new(),
            true,
            None,
        )
    }

    pub fn context(&self, id: ContextId) -> &Context {
        &self.contexts[id.0 as usize]
    }

    pub fn attribute(&self, id: AttrId) -> &Attribute {
        &self.attributes[id.0 as usize]
    }

    pub fn attr_by_name(&self, name: &str) -> Option<AttrId> {
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .map(|i| AttrId(i as u16))
    }

    /// Word boundary test: whitespace always delimits, plus the grammar's
    /// delimiter set.
    pub fn is_delimiter(&self, c: char) -> bool {
        c.is_whitespace() || self.delimiters.binary_search(&c).is_ok()
    }
}

/// A reference to one context of one loaded grammar. Frames on the context
/// stack hold these, so a stack may span grammars after a `##name` switch.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    pub set: Rc<RuleSet>,
    pub id: ContextId,
}

impl ContextHandle {
    pub fn context(&self) -> &Context {
        self.set.context(self.id)
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.set, &other.set) && self.id == other.id
    }
}

impl Eq for ContextHandle {}

/// Injected registry of loaded grammars. This is both the rule set store
/// and the cross-grammar resolver for `##name` references; `##` lookups go
/// through it lazily, so grammars that reference each other may be
/// inserted in any order.
#[derive(Default)]
pub struct GrammarStore {
    grammars: RefCell<HashMap<String, Rc<RuleSet>>>,
}

impl GrammarStore {
    pub fn new() -> Self {
        GrammarStore::default()
    }

    pub fn insert(&self, set: RuleSet) -> Rc<RuleSet> {
        let set = Rc::new(set);
        self.grammars
            .borrow_mut()
            .insert(set.name.clone(), Rc::clone(&set));
        set
    }

    pub fn resolve(&self, name: &str) -> Option<Rc<RuleSet>> {
        self.grammars.borrow().get(name).cloned()
    }

    /// Pick a grammar by file extension (case-insensitive).
    pub fn by_extension(&self, ext: &str) -> Option<Rc<RuleSet>> {
        let ext = ext.to_lowercase();
        self.grammars
            .borrow()
            .values()
            .find(|set| set.extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)))
            .cloned()
    }

    pub fn default_handle(&self, set: &Rc<RuleSet>) -> ContextHandle {
        ContextHandle {
            set: Rc::clone(set),
            id: set.default_context,
        }
    }
}
