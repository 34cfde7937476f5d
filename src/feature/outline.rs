use tracing::warn;
use tree_sitter::{Node, Parser, Tree};

/// Statements and expressions that open a branch
const BRANCH_KINDS: [&str; 7] = [
    "if_statement",
    "elif_clause",
    "for_statement",
    "while_statement",
    "boolean_operator",
    "except_clause",
    "except_group_clause",
];

const IMPORT_KINDS: [&str; 3] = [
    "import_statement",
    "import_from_statement",
    "future_import_statement",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Function,
    Class,
}

/// A `def` or `class` definition, as 1-based inclusive line range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub kind: BlockKind,
    pub name: String,
    pub start: u32,
    pub end: u32,
    /// Positional parameters, keyword-only and variadic ones excluded
    pub params: usize,
    /// Functions defined directly in a class body
    pub methods: usize,
    /// Branch points anywhere inside the definition, nested definitions included
    decisions: usize,
}

impl Block {
    pub fn contains(&self, line: u32) -> bool {
        self.start <= line && line <= self.end
    }

    pub fn lines(&self) -> u32 {
        self.end - self.start + 1
    }

    /// Cyclomatic complexity: one plus the branch points inside
    pub fn complexity(&self) -> usize {
        1 + self.decisions
    }
}

/// Definitions and module-wide counts of a Python source file
#[derive(Debug, Clone, Default)]
pub struct Outline {
    /// Definitions in source order, outer before inner
    pub blocks: Vec<Block>,
    pub imports: usize,
    /// Plain `=` assignment statements; chained targets count once
    pub assignments: usize,
    decisions: usize,
}

impl Outline {
    /// Parse with the Python grammar. Syntax errors are tolerated; whatever the
    /// parser recovers is outlined.
    pub fn parse(source: &str) -> Self {
        let mut parser = Parser::new();
        if let Err(e) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            warn!("Python grammar unavailable: {}", e);
            return Self::default();
        }
        match parser.parse(source, None) {
            Some(tree) => Self::from_tree(&tree, source.as_bytes()),
            None => Self::default(),
        }
    }

    fn from_tree(tree: &Tree, source: &[u8]) -> Self {
        let mut outline = Self::default();
        // Enclosing definitions of the current node: (block index, end byte)
        let mut open: Vec<(usize, usize)> = Vec::new();
        let mut cursor = tree.walk();

        loop {
            let node = cursor.node();
            while let Some(&(_, end)) = open.last()
                && node.start_byte() >= end
            {
                open.pop();
            }
            outline.visit(node, source, &mut open);

            if cursor.goto_first_child() {
                continue;
            }
            while !cursor.goto_next_sibling() {
                if !cursor.goto_parent() {
                    return outline;
                }
            }
        }
    }

    fn visit(&mut self, node: Node<'_>, source: &[u8], open: &mut Vec<(usize, usize)>) {
        let kind = node.kind();
        match kind {
            "function_definition" | "class_definition" => {
                let (kind, params, methods) = if kind == "function_definition" {
                    (BlockKind::Function, count_params(node), 0)
                } else {
                    (BlockKind::Class, 0, count_methods(node))
                };
                self.blocks.push(Block {
                    kind,
                    name: node
                        .child_by_field_name("name")
                        .and_then(|name| name.utf8_text(source).ok())
                        .unwrap_or_default()
                        .to_string(),
                    start: node.start_position().row as u32 + 1,
                    end: last_line(node),
                    params,
                    methods,
                    decisions: 0,
                });
                open.push((self.blocks.len() - 1, node.end_byte()));
            }
            "assignment" => {
                let plain = node.child_by_field_name("right").is_some()
                    && node.child_by_field_name("type").is_none();
                let chained = node.parent().is_some_and(|p| p.kind() == "assignment");
                if plain && !chained {
                    self.assignments += 1;
                }
            }
            _ if IMPORT_KINDS.contains(&kind) => self.imports += 1,
            _ if BRANCH_KINDS.contains(&kind) || is_async_with(node) => {
                self.decisions += 1;
                for &(block, _) in open.iter() {
                    self.blocks[block].decisions += 1;
                }
            }
            _ => {}
        }
    }

    /// Innermost block of `kind` enclosing `line`
    pub fn enclosing(&self, kind: BlockKind, line: u32) -> Option<&Block> {
        self.blocks
            .iter()
            .filter(|b| b.kind == kind && b.contains(line))
            .max_by_key(|b| b.start)
    }

    pub fn count(&self, kind: BlockKind) -> usize {
        self.blocks.iter().filter(|b| b.kind == kind).count()
    }

    /// Branch points in the whole file
    pub fn decisions(&self) -> usize {
        self.decisions
    }
}

/// 1-based line of the last character of `node`
fn last_line(node: Node<'_>) -> u32 {
    let end = node.end_position();
    let row = if end.column == 0 && end.row > node.start_position().row {
        end.row - 1
    } else {
        end.row
    };
    row as u32 + 1
}

fn is_async_with(node: Node<'_>) -> bool {
    node.kind() == "with_statement" && node.child(0).is_some_and(|c| c.kind() == "async")
}

/// Parameters before the first `*`, `*args` or `**kwargs`
fn count_params(function: Node<'_>) -> usize {
    let Some(parameters) = function.child_by_field_name("parameters") else {
        return 0;
    };
    let is_variadic = |param: Node<'_>| {
        matches!(
            param.kind(),
            "keyword_separator" | "list_splat_pattern" | "dictionary_splat_pattern"
        ) || (param.kind() == "typed_parameter"
            && param.named_child(0).is_some_and(|inner| {
                matches!(
                    inner.kind(),
                    "list_splat_pattern" | "dictionary_splat_pattern"
                )
            }))
    };

    let mut cursor = parameters.walk();
    parameters
        .named_children(&mut cursor)
        .filter(|param| param.kind() != "positional_separator" && param.kind() != "comment")
        .take_while(|param| !is_variadic(*param))
        .count()
}

/// Function definitions, decorated or not, directly in a class body
fn count_methods(class: Node<'_>) -> usize {
    let Some(body) = class.child_by_field_name("body") else {
        return 0;
    };
    let mut cursor = body.walk();
    body.named_children(&mut cursor)
        .filter(|child| match child.kind() {
            "function_definition" => true,
            "decorated_definition" => child
                .child_by_field_name("definition")
                .is_some_and(|d| d.kind() == "function_definition"),
            _ => false,
        })
        .count()
}
