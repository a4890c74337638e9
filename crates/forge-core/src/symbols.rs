//! Symbol inventories
//!
//! Generated files are parsed into a [`SymbolInventory`]: what a file
//! defines, what it explicitly exports, what it imports from other project
//! files, and which configuration attributes it touches. Parsing sits behind
//! the narrow [`SymbolParser`] trait so the validator never depends on a
//! particular grammar.
//!
//! Content that fails to parse yields an empty inventory. Parsing never
//! returns an error.

use std::collections::BTreeSet;
use std::fmt;
use tree_sitter::{Node, Parser, Tree};

/// A top-level function and its parameter names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSymbol {
    /// Function name
    pub name: String,
    /// Parameter names in declaration order
    pub params: Vec<String>,
}

/// A top-level class and its method names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSymbol {
    /// Class name
    pub name: String,
    /// Methods defined in the class body
    pub methods: Vec<String>,
}

/// A `from <module> import <names>` statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    /// Module as written, including leading dots for relative imports
    pub module: String,
    /// Imported names (original names, not aliases); empty for `import x`
    pub names: Vec<String>,
    /// 1-based line
    pub line: usize,
}

/// A type whose name marks it as configuration, with its declared fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigType {
    /// Class name
    pub name: String,
    /// Class-level assignments, annotations, `self.x` assignments and methods
    pub fields: BTreeSet<String>,
}

/// A reference like `config.debug`, `self.config.port` or `config['key']`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRef {
    /// `config` or `settings`
    pub base: String,
    /// Referenced attribute or key
    pub attribute: String,
    /// 1-based line
    pub line: usize,
}

/// Export/import inventory for one file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolInventory {
    /// Top-level functions
    pub functions: Vec<FunctionSymbol>,
    /// Top-level classes
    pub classes: Vec<ClassSymbol>,
    /// Top-level variable names
    pub variables: Vec<String>,
    /// Explicit export list (`__all__`), when declared
    pub explicit_exports: Option<Vec<String>>,
    /// Import statements
    pub imports: Vec<ImportRef>,
    /// Configuration types declared in this file
    pub config_types: Vec<ConfigType>,
    /// Configuration attribute references made by this file
    pub attribute_refs: Vec<AttributeRef>,
}

impl SymbolInventory {
    /// Names other files may import. An explicit export list takes precedence.
    pub fn exports(&self) -> BTreeSet<String> {
        if let Some(explicit) = &self.explicit_exports {
            return explicit.iter().cloned().collect();
        }
        self.functions
            .iter()
            .map(|f| f.name.clone())
            .chain(self.classes.iter().map(|c| c.name.clone()))
            .chain(self.variables.iter().cloned())
            .collect()
    }

    /// Whether nothing was found
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
            && self.classes.is_empty()
            && self.variables.is_empty()
            && self.explicit_exports.is_none()
            && self.imports.is_empty()
    }

    /// One-line-per-symbol description for prompts
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        for f in &self.functions {
            lines.push(format!("def {}({})", f.name, f.params.join(", ")));
        }
        for c in &self.classes {
            lines.push(format!("class {} [{}]", c.name, c.methods.join(", ")));
        }
        if !self.variables.is_empty() {
            lines.push(format!("vars: {}", self.variables.join(", ")));
        }
        if let Some(explicit) = &self.explicit_exports {
            lines.push(format!("__all__: {}", explicit.join(", ")));
        }
        lines.join("\n")
    }
}

/// Location of the first syntax problem in a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    /// 1-based line
    pub line: usize,
    /// 1-based column
    pub column: usize,
    /// What the parser tripped on
    pub message: String,
}

impl fmt::Display for SyntaxIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyntaxError at line {}:{}: {}", self.line, self.column, self.message)
    }
}

/// Source-to-inventory parser for one language
pub trait SymbolParser: Send + Sync + fmt::Debug {
    /// Extract symbols; unparseable input yields an empty inventory
    fn parse(&self, source: &str) -> SymbolInventory;

    /// Report the first syntax problem, if any
    fn check_syntax(&self, source: &str) -> Option<SyntaxIssue>;
}

/// Parsers keyed by file extension
#[derive(Debug)]
pub struct ParserRegistry {
    parsers: Vec<(String, Box<dyn SymbolParser>)>,
}

impl ParserRegistry {
    /// Registry without any parser
    pub fn empty() -> Self {
        Self { parsers: Vec::new() }
    }

    /// Register `parser` for files ending in `extension`
    pub fn register(mut self, extension: impl Into<String>, parser: Box<dyn SymbolParser>) -> Self {
        self.parsers.push((extension.into(), parser));
        self
    }

    /// Parser responsible for `path`
    pub fn for_path(&self, path: &str) -> Option<&dyn SymbolParser> {
        self.parsers
            .iter()
            .find(|(ext, _)| path.ends_with(ext.as_str()))
            .map(|(_, parser)| parser.as_ref())
    }

    /// Parse `source` with the parser for `path`, or return an empty inventory
    pub fn parse(&self, path: &str, source: &str) -> SymbolInventory {
        self.for_path(path)
            .map(|parser| parser.parse(source))
            .unwrap_or_default()
    }

    /// Syntax check with the parser for `path`; files without a parser pass
    pub fn check_syntax(&self, path: &str, source: &str) -> Option<SyntaxIssue> {
        self.for_path(path).and_then(|parser| parser.check_syntax(source))
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::empty().register(".py", Box::new(PythonSymbolParser))
    }
}

/// Tree-sitter based parser for Python sources
#[derive(Debug, Clone, Copy, Default)]
pub struct PythonSymbolParser;

const CONFIG_BASES: [&str; 2] = ["config", "settings"];

impl PythonSymbolParser {
    fn tree(source: &str) -> Option<Tree> {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(tree_sitter_python::language()) {
            tracing::error!("Failed to initialize Python parser: {}", e);
            return None;
        }
        parser.parse(source, None)
    }
}

impl SymbolParser for PythonSymbolParser {
    fn parse(&self, source: &str) -> SymbolInventory {
        let tree = match Self::tree(source) {
            Some(tree) => tree,
            None => return SymbolInventory::default(),
        };
        let root = tree.root_node();
        if root.has_error() {
            return SymbolInventory::default();
        }

        let src = source.as_bytes();
        let mut inventory = SymbolInventory::default();

        for node in named_children(root) {
            collect_top_level(node, src, &mut inventory);
        }
        collect_attribute_refs(root, src, &mut inventory.attribute_refs);

        inventory
    }

    fn check_syntax(&self, source: &str) -> Option<SyntaxIssue> {
        let tree = Self::tree(source)?;
        let root = tree.root_node();
        if !root.has_error() {
            return None;
        }

        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            if node.is_error() || node.is_missing() {
                let pos = node.start_position();
                let message = if node.is_missing() {
                    format!("missing '{}'", node.kind())
                } else {
                    let snippet = text(node, source.as_bytes());
                    let snippet = snippet.lines().next().unwrap_or("").trim();
                    format!("invalid syntax near '{}'", crate::text::head_chars(snippet, 40))
                };
                return Some(SyntaxIssue {
                    line: pos.row + 1,
                    column: pos.column + 1,
                    message,
                });
            }
            for i in (0..node.child_count()).rev() {
                if let Some(child) = node.child(i) {
                    if child.has_error() || child.is_missing() {
                        stack.push(child);
                    }
                }
            }
        }

        Some(SyntaxIssue {
            line: 1,
            column: 1,
            message: "invalid syntax".into(),
        })
    }
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    (0..node.named_child_count())
        .filter_map(|i| node.named_child(i))
        .collect()
}

fn text<'a>(node: Node<'_>, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}

fn line_of(node: Node<'_>) -> usize {
    node.start_position().row + 1
}

fn unquote(literal: &str) -> String {
    let body = literal.trim_start_matches(|c: char| "rbuRBUfF".contains(c));
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if let Some(inner) = body.strip_prefix(quote).and_then(|b| b.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    body.to_string()
}

fn collect_top_level(node: Node<'_>, src: &[u8], inv: &mut SymbolInventory) {
    match node.kind() {
        "function_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                inv.functions.push(FunctionSymbol {
                    name: text(name, src).to_string(),
                    params: function_params(node, src),
                });
            }
        }
        "class_definition" => collect_class(node, src, inv),
        "decorated_definition" => {
            if let Some(def) = node.child_by_field_name("definition") {
                collect_top_level(def, src, inv);
            }
        }
        "expression_statement" => {
            for child in named_children(node) {
                if child.kind() == "assignment" {
                    collect_assignment(child, src, inv);
                }
            }
        }
        "import_from_statement" => {
            let module = node
                .child_by_field_name("module_name")
                .map(|m| text(m, src).replace(char::is_whitespace, ""))
                .unwrap_or_default();
            let mut names = Vec::new();
            for child in named_children(node) {
                if node.child_by_field_name("module_name") == Some(child) {
                    continue;
                }
                match child.kind() {
                    "dotted_name" => names.push(text(child, src).to_string()),
                    "aliased_import" => {
                        if let Some(name) = child.child_by_field_name("name") {
                            names.push(text(name, src).to_string());
                        }
                    }
                    _ => {}
                }
            }
            inv.imports.push(ImportRef {
                module,
                names,
                line: line_of(node),
            });
        }
        "import_statement" => {
            for child in named_children(node) {
                let module = match child.kind() {
                    "aliased_import" => child
                        .child_by_field_name("name")
                        .map(|n| text(n, src).to_string()),
                    _ => Some(text(child, src).to_string()),
                };
                if let Some(module) = module {
                    inv.imports.push(ImportRef {
                        module,
                        names: Vec::new(),
                        line: line_of(node),
                    });
                }
            }
        }
        _ => {}
    }
}

fn function_params(func: Node<'_>, src: &[u8]) -> Vec<String> {
    let params = match func.child_by_field_name("parameters") {
        Some(p) => p,
        None => return Vec::new(),
    };
    named_children(params)
        .into_iter()
        .filter_map(|p| match p.kind() {
            "identifier" => Some(text(p, src).to_string()),
            "default_parameter" | "typed_default_parameter" => p
                .child_by_field_name("name")
                .map(|n| text(n, src).to_string()),
            "typed_parameter" => p.named_child(0).map(|n| text(n, src).to_string()),
            "list_splat_pattern" | "dictionary_splat_pattern" => Some(text(p, src).to_string()),
            _ => None,
        })
        .collect()
}

fn collect_assignment(assign: Node<'_>, src: &[u8], inv: &mut SymbolInventory) {
    let left = match assign.child_by_field_name("left") {
        Some(left) => left,
        None => return,
    };
    if left.kind() != "identifier" {
        return;
    }
    let name = text(left, src);
    if name == "__all__" {
        if let Some(right) = assign.child_by_field_name("right") {
            let exports = named_children(right)
                .into_iter()
                .filter(|item| item.kind() == "string")
                .map(|item| unquote(text(item, src)))
                .collect();
            inv.explicit_exports = Some(exports);
        }
        return;
    }
    inv.variables.push(name.to_string());
}

fn collect_class(class: Node<'_>, src: &[u8], inv: &mut SymbolInventory) {
    let name = match class.child_by_field_name("name") {
        Some(name) => text(name, src).to_string(),
        None => return,
    };
    let body = class.child_by_field_name("body");
    let mut methods = Vec::new();
    let mut fields = BTreeSet::new();

    if let Some(body) = body {
        for item in named_children(body) {
            let item = if item.kind() == "decorated_definition" {
                match item.child_by_field_name("definition") {
                    Some(def) => def,
                    None => continue,
                }
            } else {
                item
            };
            match item.kind() {
                "function_definition" => {
                    if let Some(method) = item.child_by_field_name("name") {
                        methods.push(text(method, src).to_string());
                    }
                    collect_self_assignments(item, src, &mut fields);
                }
                "expression_statement" => {
                    for child in named_children(item) {
                        if child.kind() != "assignment" {
                            continue;
                        }
                        if let Some(left) = child.child_by_field_name("left") {
                            if left.kind() == "identifier" {
                                fields.insert(text(left, src).to_string());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    let lowered = name.to_lowercase();
    if CONFIG_BASES.iter().any(|base| lowered.contains(base)) {
        fields.extend(methods.iter().cloned());
        inv.config_types.push(ConfigType {
            name: name.clone(),
            fields,
        });
    }
    inv.classes.push(ClassSymbol { name, methods });
}

fn collect_self_assignments(method: Node<'_>, src: &[u8], fields: &mut BTreeSet<String>) {
    let mut stack = vec![method];
    while let Some(node) = stack.pop() {
        if node.kind() == "assignment" {
            if let Some(left) = node.child_by_field_name("left") {
                if left.kind() == "attribute" {
                    let object = left.child_by_field_name("object").map(|o| text(o, src));
                    if object == Some("self") {
                        if let Some(attr) = left.child_by_field_name("attribute") {
                            fields.insert(text(attr, src).to_string());
                        }
                    }
                }
            }
        }
        stack.extend(named_children(node));
    }
}

/// `config`/`settings` as a bare name or as the last hop of an attribute chain
fn config_base(node: Node<'_>, src: &[u8]) -> Option<String> {
    let name = match node.kind() {
        "identifier" => text(node, src),
        "attribute" => node.child_by_field_name("attribute").map(|a| text(a, src))?,
        _ => return None,
    };
    CONFIG_BASES
        .iter()
        .find(|base| **base == name)
        .map(|base| base.to_string())
}

fn collect_attribute_refs(root: Node<'_>, src: &[u8], refs: &mut Vec<AttributeRef>) {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node.kind() {
            "attribute" => {
                if let (Some(object), Some(attr)) = (
                    node.child_by_field_name("object"),
                    node.child_by_field_name("attribute"),
                ) {
                    if let Some(base) = config_base(object, src) {
                        refs.push(AttributeRef {
                            base,
                            attribute: text(attr, src).to_string(),
                            line: line_of(node),
                        });
                    }
                }
            }
            "subscript" => {
                if let (Some(value), Some(key)) = (
                    node.child_by_field_name("value"),
                    node.child_by_field_name("subscript"),
                ) {
                    if key.kind() == "string" {
                        if let Some(base) = config_base(value, src) {
                            refs.push(AttributeRef {
                                base,
                                attribute: unquote(text(key, src)),
                                line: line_of(node),
                            });
                        }
                    }
                }
            }
            _ => {}
        }
        stack.extend(named_children(node));
    }
    refs.sort_by_key(|r| r.line);
}
