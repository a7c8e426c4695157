//! Builtin detection rules.
//!
//! Each rule is a small, self-contained predicate over the structural tree.
//! Severity policy: things that will break at runtime are errors, smells
//! with a known safer shape are warnings, and advisory measurements are
//! info. Two rules (`bare-except`, `unused-import`) declare deterministic
//! rewrites; the rest leave fixing to the model path.

use super::{Finding, Rule, Severity, Span};
use crate::source::SourceUnit;
use std::collections::{HashMap, HashSet};
use tree_sitter::Node;

/// The standard rule set, in registration order.
pub fn all() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(UndefinedName),
        Box::new(CallArity),
        Box::new(UnreachableCode),
        Box::new(UnboundedLoop),
        Box::new(BareExcept),
        Box::new(MutableDefault),
        Box::new(DangerousCall),
        Box::new(UnusedImport),
        Box::new(HighComplexity),
    ]
}

// ───────────────────────────────────────────────────────────────────────────
//  Tree helpers
// ───────────────────────────────────────────────────────────────────────────

fn node_text<'a>(node: &Node, src: &'a str) -> &'a str {
    &src[node.start_byte()..node.end_byte()]
}

/// Depth-first visit of every node in the subtree.
fn walk<'t>(node: Node<'t>, visit: &mut dyn FnMut(Node<'t>)) {
    visit(node);
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, visit);
    }
}

fn root<'a>(unit: &'a SourceUnit) -> Option<Node<'a>> {
    unit.tree().map(|t| t.root_node())
}

/// Name of the function a node sits inside, if any.
fn enclosing_function_name(node: &Node, src: &str) -> Option<String> {
    let mut current = node.parent();
    while let Some(n) = current {
        if n.kind() == "function_definition" {
            return n
                .child_by_field_name("name")
                .map(|name| node_text(&name, src).to_string());
        }
        current = n.parent();
    }
    None
}

/// Collect identifiers bound by an assignment-target pattern
/// (`a`, `a, b = ...`, `[a, b] = ...`).
fn pattern_identifiers(node: Node, src: &str, out: &mut HashSet<String>, ids: &mut HashSet<usize>) {
    if node.kind() == "identifier" {
        out.insert(node_text(&node, src).to_string());
        ids.insert(node.id());
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        pattern_identifiers(child, src, out, ids);
    }
}

/// Remove the given 1-based inclusive line range from the source.
fn remove_lines(src: &str, start_line: usize, end_line: usize) -> String {
    let kept: Vec<&str> = src
        .lines()
        .enumerate()
        .filter(|(i, _)| {
            let line = i + 1;
            line < start_line || line > end_line
        })
        .map(|(_, l)| l)
        .collect();
    let mut out = kept.join("\n");
    if src.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

// ───────────────────────────────────────────────────────────────────────────
//  undefined-name
// ───────────────────────────────────────────────────────────────────────────

/// Names the Python interpreter provides without any binding in the file.
/// Not exhaustive, deliberately: missing an obscure builtin costs one false
/// positive; flagging a common one would poison every analysis.
const PYTHON_BUILTINS: &[&str] = &[
    "abs", "all", "any", "ascii", "bin", "bool", "bytearray", "bytes", "callable", "chr",
    "classmethod", "complex", "delattr", "dict", "dir", "divmod", "enumerate", "exit", "filter",
    "float", "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id",
    "input", "int", "isinstance", "issubclass", "iter", "len", "list", "locals", "map", "max",
    "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print", "property",
    "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice", "sorted",
    "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip", "__name__",
    "__file__", "__doc__", "ArithmeticError", "AssertionError", "AttributeError",
    "BaseException", "Exception", "FileNotFoundError", "ImportError", "IndexError",
    "KeyError", "KeyboardInterrupt", "LookupError", "ModuleNotFoundError", "NameError",
    "NotImplemented", "NotImplementedError", "OSError", "OverflowError", "PermissionError",
    "RecursionError", "RuntimeError", "StopIteration", "SystemExit", "TypeError",
    "UnicodeDecodeError", "UnicodeEncodeError", "ValueError", "ZeroDivisionError",
];

/// Best-effort undefined variable detection: collect every name the file
/// binds anywhere, then flag loads of names bound nowhere. Whole-file
/// collection keeps forward references (helpers defined below their caller)
/// from false-positiving, at the cost of missing use-before-assignment.
struct UndefinedName;

impl UndefinedName {
    fn collect_bindings(
        root: Node,
        src: &str,
        bound: &mut HashSet<String>,
        binding_sites: &mut HashSet<usize>,
    ) {
        walk(root, &mut |node| match node.kind() {
            "assignment" | "augmented_assignment" => {
                if let Some(left) = node.child_by_field_name("left") {
                    pattern_identifiers(left, src, bound, binding_sites);
                }
            }
            "named_expression" => {
                if let Some(name) = node.child_by_field_name("name") {
                    pattern_identifiers(name, src, bound, binding_sites);
                }
            }
            "for_statement" | "for_in_clause" => {
                if let Some(left) = node.child_by_field_name("left") {
                    pattern_identifiers(left, src, bound, binding_sites);
                }
            }
            "function_definition" | "class_definition" => {
                if let Some(name) = node.child_by_field_name("name") {
                    bound.insert(node_text(&name, src).to_string());
                    binding_sites.insert(name.id());
                }
            }
            "parameters" | "lambda_parameters" => {
                let mut cursor = node.walk();
                for param in node.named_children(&mut cursor) {
                    match param.kind() {
                        "identifier" => {
                            bound.insert(node_text(&param, src).to_string());
                            binding_sites.insert(param.id());
                        }
                        "default_parameter" | "typed_default_parameter" | "typed_parameter" => {
                            let name = param
                                .child_by_field_name("name")
                                .or_else(|| param.named_child(0));
                            if let Some(name) = name {
                                if name.kind() == "identifier" {
                                    bound.insert(node_text(&name, src).to_string());
                                    binding_sites.insert(name.id());
                                }
                            }
                        }
                        "list_splat_pattern" | "dictionary_splat_pattern" => {
                            if let Some(inner) = param.named_child(0) {
                                pattern_identifiers(inner, src, bound, binding_sites);
                            }
                        }
                        _ => {}
                    }
                }
            }
            "as_pattern_target" => {
                pattern_identifiers(node, src, bound, binding_sites);
            }
            "global_statement" | "nonlocal_statement" => {
                let mut cursor = node.walk();
                for child in node.named_children(&mut cursor) {
                    if child.kind() == "identifier" {
                        bound.insert(node_text(&child, src).to_string());
                        binding_sites.insert(child.id());
                    }
                }
            }
            _ => {}
        });
    }

    /// True when this identifier is a value read, as opposed to a binding
    /// site, an attribute name, a keyword-argument name, or part of an
    /// import statement.
    fn is_load(node: &Node) -> bool {
        let Some(parent) = node.parent() else {
            return false;
        };
        match parent.kind() {
            "attribute" => {
                // `obj.attr` reads `obj` but not `attr`.
                parent
                    .child_by_field_name("object")
                    .map(|o| o.id() == node.id())
                    .unwrap_or(false)
            }
            "keyword_argument" => parent
                .child_by_field_name("value")
                .map(|v| v.id() == node.id())
                .unwrap_or(false),
            "dotted_name" | "aliased_import" | "import_statement" | "import_from_statement"
            | "relative_import" | "wildcard_import" => false,
            _ => true,
        }
    }
}

impl Rule for UndefinedName {
    fn id(&self) -> &'static str {
        "undefined-name"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut bound = HashSet::new();
        let mut binding_sites = HashSet::new();
        Self::collect_bindings(root, src, &mut bound, &mut binding_sites);

        let mut findings = Vec::new();
        let mut reported = HashSet::new();
        walk(root, &mut |node| {
            if node.kind() != "identifier" || binding_sites.contains(&node.id()) {
                return;
            }
            if !Self::is_load(&node) {
                return;
            }
            let name = node_text(&node, src);
            if bound.contains(name) || PYTHON_BUILTINS.contains(&name) {
                return;
            }
            // One finding per name keeps a repeated typo from flooding the
            // report.
            if !reported.insert(name.to_string()) {
                return;
            }
            findings.push(Finding::new(
                self.id(),
                Severity::Error,
                Span::from_node(&node),
                format!("possibly undefined variable: '{}'", name),
            ));
        });
        Ok(findings)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  call-arity
// ───────────────────────────────────────────────────────────────────────────

/// Mismatched positional argument count for functions defined in the same
/// snippet. Skips anything with defaults, splats, or an enclosing class,
/// where counting positionals is no longer trivial.
struct CallArity;

impl CallArity {
    fn simple_arity(func: &Node) -> Option<usize> {
        let params = func.child_by_field_name("parameters")?;
        let mut arity = 0usize;
        let mut cursor = params.walk();
        for param in params.named_children(&mut cursor) {
            match param.kind() {
                "identifier" | "typed_parameter" => arity += 1,
                "comment" => {}
                // Defaults and splats make the callable variadic enough
                // that a positional count proves nothing.
                _ => return None,
            }
        }
        Some(arity)
    }

    fn inside_class(node: &Node) -> bool {
        let mut current = node.parent();
        while let Some(n) = current {
            if n.kind() == "class_definition" {
                return true;
            }
            current = n.parent();
        }
        false
    }
}

impl Rule for CallArity {
    fn id(&self) -> &'static str {
        "call-arity"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut arities: HashMap<String, usize> = HashMap::new();
        walk(root, &mut |node| {
            if node.kind() != "function_definition" || Self::inside_class(&node) {
                return;
            }
            if let (Some(name), Some(arity)) =
                (node.child_by_field_name("name"), Self::simple_arity(&node))
            {
                arities.insert(node_text(&name, src).to_string(), arity);
            }
        });

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "call" {
                return;
            }
            let Some(func) = node.child_by_field_name("function") else {
                return;
            };
            if func.kind() != "identifier" {
                return;
            }
            let name = node_text(&func, src);
            let Some(&expected) = arities.get(name) else {
                return;
            };
            let Some(args) = node.child_by_field_name("arguments") else {
                return;
            };

            let mut actual = 0usize;
            let mut countable = true;
            let mut cursor = args.walk();
            for arg in args.named_children(&mut cursor) {
                match arg.kind() {
                    "keyword_argument" | "list_splat" | "dictionary_splat" => {
                        countable = false;
                    }
                    "comment" => {}
                    _ => actual += 1,
                }
            }
            if countable && actual != expected {
                findings.push(Finding::new(
                    self.id(),
                    Severity::Error,
                    Span::from_node(&node),
                    format!(
                        "call to '{}' with {} argument{}, but '{}' takes {}",
                        name,
                        actual,
                        if actual == 1 { "" } else { "s" },
                        name,
                        expected
                    ),
                ));
            }
        });
        Ok(findings)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  unreachable-code
// ───────────────────────────────────────────────────────────────────────────

struct UnreachableCode;

impl Rule for UnreachableCode {
    fn id(&self) -> &'static str {
        "unreachable-code"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "function_definition" {
                return;
            }
            let Some(body) = node.child_by_field_name("body") else {
                return;
            };
            let name = node
                .child_by_field_name("name")
                .map(|n| node_text(&n, src).to_string())
                .unwrap_or_else(|| "<lambda>".to_string());

            let mut returned = false;
            let mut cursor = body.walk();
            for stmt in body.named_children(&mut cursor) {
                if stmt.kind() == "return_statement" {
                    returned = true;
                } else if returned && stmt.kind() != "comment" {
                    findings.push(
                        Finding::new(
                            self.id(),
                            Severity::Warning,
                            Span::from_node(&stmt),
                            format!("unreachable code after return in '{}'", name),
                        )
                        .with_meta(serde_json::json!({
                            "block_end_line": body.end_position().row + 1,
                        })),
                    );
                    break;
                }
            }
        });
        Ok(findings)
    }

    fn rewrite(&self, unit: &SourceUnit, finding: &Finding) -> Option<String> {
        let end = finding.metadata.get("block_end_line")?.as_u64()? as usize;
        Some(remove_lines(&unit.text, finding.span.start_line, end))
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  unbounded-loop
// ───────────────────────────────────────────────────────────────────────────

struct UnboundedLoop;

impl Rule for UnboundedLoop {
    fn id(&self) -> &'static str {
        "unbounded-loop"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "while_statement" {
                return;
            }
            let Some(condition) = node.child_by_field_name("condition") else {
                return;
            };
            let always_true = condition.kind() == "true"
                || (condition.kind() == "integer" && node_text(&condition, src) == "1");
            if !always_true {
                return;
            }

            let Some(body) = node.child_by_field_name("body") else {
                return;
            };
            let mut has_break = false;
            walk(body, &mut |n| {
                if n.kind() == "break_statement" {
                    has_break = true;
                }
            });
            if !has_break {
                findings.push(Finding::new(
                    self.id(),
                    Severity::Warning,
                    Span::from_node(&node),
                    "'while True' loop with no break or termination condition".to_string(),
                ));
            }
        });
        Ok(findings)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  bare-except
// ───────────────────────────────────────────────────────────────────────────

struct BareExcept;

impl Rule for BareExcept {
    fn id(&self) -> &'static str {
        "bare-except"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "except_clause" {
                return;
            }
            // A typed handler has an expression child before its block.
            let mut cursor = node.walk();
            let bare = !node
                .named_children(&mut cursor)
                .any(|c| c.kind() != "block" && c.kind() != "comment");
            if bare {
                findings.push(Finding::new(
                    self.id(),
                    Severity::Warning,
                    Span::from_node(&node),
                    "bare 'except:' catches all exceptions, including SystemExit".to_string(),
                ));
            }
        });
        Ok(findings)
    }

    fn rewrite(&self, unit: &SourceUnit, finding: &Finding) -> Option<String> {
        let pattern = regex::Regex::new(r"except\s*:").ok()?;
        let mut lines: Vec<String> = unit.text.lines().map(String::from).collect();
        let idx = finding.span.start_line.checked_sub(1)?;
        let line = lines.get(idx)?;
        if !pattern.is_match(line) {
            return None;
        }
        lines[idx] = pattern.replace(line, "except Exception:").into_owned();
        let mut out = lines.join("\n");
        if unit.text.ends_with('\n') {
            out.push('\n');
        }
        Some(out)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  mutable-default
// ───────────────────────────────────────────────────────────────────────────

struct MutableDefault;

impl Rule for MutableDefault {
    fn id(&self) -> &'static str {
        "mutable-default"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "default_parameter" && node.kind() != "typed_default_parameter" {
                return;
            }
            let Some(value) = node.child_by_field_name("value") else {
                return;
            };
            if matches!(value.kind(), "list" | "dictionary" | "set") {
                let owner = enclosing_function_name(&node, src)
                    .unwrap_or_else(|| "<lambda>".to_string());
                findings.push(Finding::new(
                    self.id(),
                    Severity::Warning,
                    Span::from_node(&value),
                    format!(
                        "mutable default argument in '{}'; use None and assign inside",
                        owner
                    ),
                ));
            }
        });
        Ok(findings)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  dangerous-call
// ───────────────────────────────────────────────────────────────────────────

struct DangerousCall;

impl Rule for DangerousCall {
    fn id(&self) -> &'static str {
        "dangerous-call"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "call" {
                return;
            }
            let Some(func) = node.child_by_field_name("function") else {
                return;
            };
            let name = match func.kind() {
                "identifier" => node_text(&func, src),
                "attribute" => func
                    .child_by_field_name("attribute")
                    .map(|a| node_text(&a, src))
                    .unwrap_or(""),
                _ => "",
            };
            if name == "eval" || name == "exec" {
                findings.push(Finding::new(
                    self.id(),
                    Severity::Warning,
                    Span::from_node(&node),
                    format!("use of '{}()' executes arbitrary strings", name),
                ));
            }
        });
        Ok(findings)
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  unused-import
// ───────────────────────────────────────────────────────────────────────────

struct UnusedImport;

impl UnusedImport {
    /// (bound name, statement node) pairs for one import statement.
    fn bindings<'a>(stmt: &Node<'a>, src: &str) -> Vec<(String, Node<'a>)> {
        let mut out = Vec::new();
        let mut cursor = stmt.walk();
        match stmt.kind() {
            "import_statement" => {
                for child in stmt.named_children(&mut cursor) {
                    match child.kind() {
                        "dotted_name" => {
                            // `import os.path` binds `os`.
                            if let Some(first) = child.named_child(0) {
                                out.push((node_text(&first, src).to_string(), *stmt));
                            }
                        }
                        "aliased_import" => {
                            if let Some(alias) = child.child_by_field_name("alias") {
                                out.push((node_text(&alias, src).to_string(), *stmt));
                            }
                        }
                        _ => {}
                    }
                }
            }
            "import_from_statement" => {
                let module = stmt.child_by_field_name("module_name");
                for child in stmt.named_children(&mut cursor) {
                    if let Some(module) = &module {
                        if child.id() == module.id() {
                            continue;
                        }
                    }
                    match child.kind() {
                        "dotted_name" | "identifier" => {
                            out.push((node_text(&child, src).to_string(), *stmt));
                        }
                        "aliased_import" => {
                            if let Some(alias) = child.child_by_field_name("alias") {
                                out.push((node_text(&alias, src).to_string(), *stmt));
                            }
                        }
                        // `from x import *` defeats usage tracking.
                        "wildcard_import" => return Vec::new(),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        out
    }
}

impl Rule for UnusedImport {
    fn id(&self) -> &'static str {
        "unused-import"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut imports: Vec<(String, Node)> = Vec::new();
        walk(root, &mut |node| {
            if node.kind() == "import_statement" || node.kind() == "import_from_statement" {
                imports.extend(Self::bindings(&node, src));
            }
        });
        if imports.is_empty() {
            return Ok(Vec::new());
        }

        // Count statement-local bindings so a one-name statement can be
        // removed outright by the rewrite.
        let mut per_stmt: HashMap<usize, usize> = HashMap::new();
        for (_, stmt) in &imports {
            *per_stmt.entry(stmt.id()).or_insert(0) += 1;
        }

        let mut findings = Vec::new();
        for (name, stmt) in &imports {
            let mut used = false;
            walk(root, &mut |node| {
                if used || node.kind() != "identifier" {
                    return;
                }
                // Occurrences inside the import statement itself don't count.
                if node.start_byte() >= stmt.start_byte() && node.end_byte() <= stmt.end_byte() {
                    return;
                }
                if node_text(&node, src) == name {
                    used = true;
                }
            });
            if !used {
                findings.push(
                    Finding::new(
                        self.id(),
                        Severity::Warning,
                        Span::from_node(stmt),
                        format!("unused import: '{}'", name),
                    )
                    .with_meta(serde_json::json!({
                        "removable": per_stmt.get(&stmt.id()) == Some(&1),
                    })),
                );
            }
        }
        Ok(findings)
    }

    fn rewrite(&self, unit: &SourceUnit, finding: &Finding) -> Option<String> {
        if finding.metadata.get("removable") != Some(&serde_json::Value::Bool(true)) {
            return None;
        }
        Some(remove_lines(
            &unit.text,
            finding.span.start_line,
            finding.span.end_line,
        ))
    }
}

// ───────────────────────────────────────────────────────────────────────────
//  high-complexity
// ───────────────────────────────────────────────────────────────────────────

const COMPLEXITY_THRESHOLD: usize = 10;

/// Cyclomatic estimate: 1 + decision points in the function subtree.
struct HighComplexity;

impl Rule for HighComplexity {
    fn id(&self) -> &'static str {
        "high-complexity"
    }

    fn check(&self, unit: &SourceUnit) -> anyhow::Result<Vec<Finding>> {
        let Some(root) = root(unit) else {
            return Ok(Vec::new());
        };
        let src = &unit.text;

        let mut findings = Vec::new();
        walk(root, &mut |node| {
            if node.kind() != "function_definition" {
                return;
            }
            let mut score = 1usize;
            walk(node, &mut |n| {
                if matches!(
                    n.kind(),
                    "if_statement"
                        | "elif_clause"
                        | "for_statement"
                        | "while_statement"
                        | "except_clause"
                        | "with_statement"
                        | "assert_statement"
                        | "conditional_expression"
                        | "boolean_operator"
                        | "for_in_clause"
                ) {
                    score += 1;
                }
            });
            if score >= COMPLEXITY_THRESHOLD {
                let name = node
                    .child_by_field_name("name")
                    .map(|n| node_text(&n, src).to_string())
                    .unwrap_or_else(|| "<lambda>".to_string());
                findings.push(
                    Finding::new(
                        self.id(),
                        Severity::Info,
                        Span::from_node(&node),
                        format!(
                            "'{}' has high cyclomatic complexity ({}); consider refactoring",
                            name, score
                        ),
                    )
                    .with_meta(serde_json::json!({ "complexity": score })),
                );
            }
        });
        Ok(findings)
    }
}
