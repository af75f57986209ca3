//! Workflow language surface consumed by the engine.
//!
//! The parser lives upstream; the engine receives a [`Namespace`] holding the
//! task table, imported namespaces, and the workflow scope tree. On
//! construction the namespace flattens the tree into an indexed view so the
//! scheduler can answer ancestry and prerequisite queries without walking the
//! AST.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::values::{CoercionError, ValueType, WorkflowValue};

/// Fully qualified name of a scope, e.g. `wf.align` or `wf.$scatter_0.align`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fqn(String);

impl Fqn {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn child(&self, name: &str) -> Fqn {
        Fqn(format!("{}.{name}", self.0))
    }
}

impl fmt::Display for Fqn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Error)]
pub enum ExpressionError {
    #[error("unresolved identifier {identifier:?}")]
    Unresolved { identifier: String },
    #[error("cannot index into {0}")]
    NotIndexable(String),
    #[error("index {index} out of bounds for array of length {len}")]
    IndexOutOfBounds { index: i64, len: usize },
    #[error("array index must be an Int, got {0}")]
    NonIntegerIndex(String),
    #[error(transparent)]
    Coercion(#[from] CoercionError),
}

/// Identifier lookup environment for expression evaluation. The engine
/// resolves every referenced identifier up front (symbol resolution hits
/// durable storage), then evaluates synchronously against the environment.
pub trait Lookup {
    fn lookup(&self, identifier: &str) -> Result<WorkflowValue, ExpressionError>;
}

impl Lookup for HashMap<String, WorkflowValue> {
    fn lookup(&self, identifier: &str) -> Result<WorkflowValue, ExpressionError> {
        self.get(identifier)
            .cloned()
            .ok_or_else(|| ExpressionError::Unresolved {
                identifier: identifier.to_string(),
            })
    }
}

/// An input or collection expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    Literal(WorkflowValue),
    /// A possibly-dotted reference (`x`, `align.bam`, `lib.threshold`).
    /// Dotted references are resolved as a unit by the symbol resolver.
    Identifier(String),
    ArrayLiteral(Vec<Expression>),
    Index(Box<Expression>, Box<Expression>),
}

impl Expression {
    pub fn identifier(name: impl Into<String>) -> Self {
        Expression::Identifier(name.into())
    }

    /// Every identifier referenced anywhere in this expression.
    pub fn identifiers(&self) -> Vec<&str> {
        let mut found = Vec::new();
        self.collect_identifiers(&mut found);
        found
    }

    fn collect_identifiers<'a>(&'a self, found: &mut Vec<&'a str>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Identifier(name) => {
                if !found.contains(&name.as_str()) {
                    found.push(name);
                }
            }
            Expression::ArrayLiteral(items) => {
                for item in items {
                    item.collect_identifiers(found);
                }
            }
            Expression::Index(base, index) => {
                base.collect_identifiers(found);
                index.collect_identifiers(found);
            }
        }
    }

    pub fn evaluate(&self, env: &dyn Lookup) -> Result<WorkflowValue, ExpressionError> {
        match self {
            Expression::Literal(value) => Ok(value.clone()),
            Expression::Identifier(name) => env.lookup(name),
            Expression::ArrayLiteral(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(item.evaluate(env)?);
                }
                Ok(WorkflowValue::Array(values))
            }
            Expression::Index(base, index) => {
                let base = base.evaluate(env)?;
                let index = index.evaluate(env)?;
                let items = match &base {
                    WorkflowValue::Array(items) => items,
                    other => return Err(ExpressionError::NotIndexable(other.type_name())),
                };
                let i = match index {
                    WorkflowValue::Integer(i) => i,
                    other => return Err(ExpressionError::NonIntegerIndex(other.type_name())),
                };
                usize::try_from(i)
                    .ok()
                    .and_then(|i| items.get(i))
                    .cloned()
                    .ok_or(ExpressionError::IndexOutOfBounds {
                        index: i,
                        len: items.len(),
                    })
            }
        }
    }
}

/// A declared task input.
#[derive(Debug, Clone)]
pub struct TaskInput {
    pub name: String,
    pub value_type: ValueType,
}

/// A declared task output.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub name: String,
    pub value_type: ValueType,
}

/// A task definition. The command body is backend territory; the engine only
/// needs the input/output signature.
#[derive(Debug, Clone)]
pub struct Task {
    pub name: String,
    pub inputs: Vec<TaskInput>,
    pub outputs: Vec<TaskOutput>,
}

impl Task {
    pub fn input(&self, name: &str) -> Option<&TaskInput> {
        self.inputs.iter().find(|input| input.name == name)
    }
}

/// A call statement binding input expressions to a task.
#[derive(Debug, Clone)]
pub struct Call {
    /// Local name (the task name, or its alias).
    pub name: String,
    pub task: String,
    pub inputs: Vec<(String, Expression)>,
}

/// A scatter block over a collection expression.
#[derive(Debug, Clone)]
pub struct Scatter {
    pub item: String,
    pub collection: Expression,
    pub body: Vec<WorkflowNode>,
}

/// A value declaration.
#[derive(Debug, Clone)]
pub struct Declaration {
    pub name: String,
    pub value_type: ValueType,
    pub expression: Option<Expression>,
}

#[derive(Debug, Clone)]
pub enum WorkflowNode {
    Call(Call),
    Scatter(Scatter),
    Declaration(Declaration),
}

/// The workflow definition as handed over by the parser.
#[derive(Debug, Clone)]
pub struct Workflow {
    pub name: String,
    pub body: Vec<WorkflowNode>,
}

#[derive(Debug, Error)]
pub enum LangError {
    #[error("call {call} references unknown task {task:?}")]
    UnknownTask { call: Fqn, task: String },
    #[error("call {call} supplies input {input:?} not declared by task {task:?}")]
    UnknownInput {
        call: Fqn,
        task: String,
        input: String,
    },
    #[error("duplicate scope name {0}")]
    DuplicateScope(Fqn),
    #[error("scatter {0} is nested inside another scatter, which is unsupported")]
    NestedScatter(Fqn),
}

/// Kind of an indexed scope.
#[derive(Debug, Clone)]
pub enum ScopeKind {
    Call(Call),
    Scatter {
        item: String,
        collection: Expression,
    },
    Declaration(Declaration),
}

/// One entry in the flattened scope index.
#[derive(Debug, Clone)]
pub struct ScopeEntry {
    pub fqn: Fqn,
    pub parent: Option<Fqn>,
    pub kind: ScopeKind,
}

impl ScopeEntry {
    pub fn as_call(&self) -> Option<&Call> {
        match &self.kind {
            ScopeKind::Call(call) => Some(call),
            _ => None,
        }
    }

    pub fn is_scatter(&self) -> bool {
        matches!(self.kind, ScopeKind::Scatter { .. })
    }
}

/// A validated namespace: the workflow, its task table, imported namespaces,
/// and the flattened scope index.
#[derive(Debug, Clone)]
pub struct Namespace {
    workflow_name: String,
    tasks: HashMap<String, Task>,
    imported: HashMap<String, Namespace>,
    scopes: HashMap<Fqn, ScopeEntry>,
    /// Scope FQNs in lexical order, calls and scatters only.
    lexical: Vec<Fqn>,
}

impl Namespace {
    pub fn new(
        workflow: Workflow,
        tasks: Vec<Task>,
        imported: HashMap<String, Namespace>,
    ) -> Result<Self, LangError> {
        let task_table: HashMap<String, Task> =
            tasks.into_iter().map(|t| (t.name.clone(), t)).collect();
        let mut namespace = Namespace {
            workflow_name: workflow.name.clone(),
            tasks: task_table,
            imported,
            scopes: HashMap::new(),
            lexical: Vec::new(),
        };
        let root = Fqn::new(workflow.name.clone());
        let mut scatter_counter = 0usize;
        namespace.index_nodes(&workflow.body, &root, None, &mut scatter_counter)?;
        namespace.validate()?;
        Ok(namespace)
    }

    fn index_nodes(
        &mut self,
        nodes: &[WorkflowNode],
        prefix: &Fqn,
        parent: Option<&Fqn>,
        scatter_counter: &mut usize,
    ) -> Result<(), LangError> {
        for node in nodes {
            match node {
                WorkflowNode::Call(call) => {
                    let fqn = prefix.child(&call.name);
                    self.insert_scope(fqn, parent.cloned(), ScopeKind::Call(call.clone()))?;
                }
                WorkflowNode::Declaration(decl) => {
                    let fqn = prefix.child(&decl.name);
                    self.insert_scope(
                        fqn,
                        parent.cloned(),
                        ScopeKind::Declaration(decl.clone()),
                    )?;
                }
                WorkflowNode::Scatter(scatter) => {
                    let name = format!("$scatter_{scatter_counter}");
                    *scatter_counter += 1;
                    let fqn = prefix.child(&name);
                    self.insert_scope(
                        fqn.clone(),
                        parent.cloned(),
                        ScopeKind::Scatter {
                            item: scatter.item.clone(),
                            collection: scatter.collection.clone(),
                        },
                    )?;
                    self.index_nodes(&scatter.body, &fqn, Some(&fqn), scatter_counter)?;
                }
            }
        }
        Ok(())
    }

    fn insert_scope(
        &mut self,
        fqn: Fqn,
        parent: Option<Fqn>,
        kind: ScopeKind,
    ) -> Result<(), LangError> {
        if self.scopes.contains_key(&fqn) {
            return Err(LangError::DuplicateScope(fqn));
        }
        if !matches!(kind, ScopeKind::Declaration(_)) {
            self.lexical.push(fqn.clone());
        }
        self.scopes.insert(fqn.clone(), ScopeEntry { fqn, parent, kind });
        Ok(())
    }

    fn validate(&self) -> Result<(), LangError> {
        for entry in self.scopes.values() {
            match &entry.kind {
                ScopeKind::Call(call) => {
                    let task = self.tasks.get(&call.task).ok_or_else(|| {
                        LangError::UnknownTask {
                            call: entry.fqn.clone(),
                            task: call.task.clone(),
                        }
                    })?;
                    for (input_name, _) in &call.inputs {
                        if task.input(input_name).is_none() {
                            return Err(LangError::UnknownInput {
                                call: entry.fqn.clone(),
                                task: task.name.clone(),
                                input: input_name.clone(),
                            });
                        }
                    }
                }
                ScopeKind::Scatter { .. } => {
                    if self.scatter_ancestor(&entry.fqn).is_some() {
                        return Err(LangError::NestedScatter(entry.fqn.clone()));
                    }
                }
                ScopeKind::Declaration(_) => {}
            }
        }
        Ok(())
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn root_fqn(&self) -> Fqn {
        Fqn::new(self.workflow_name.clone())
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn imported(&self, name: &str) -> Option<&Namespace> {
        self.imported.get(name)
    }

    pub fn scope(&self, fqn: &Fqn) -> Option<&ScopeEntry> {
        self.scopes.get(fqn)
    }

    /// Calls and scatters in lexical order.
    pub fn lexical_scopes(&self) -> impl Iterator<Item = &ScopeEntry> {
        self.lexical.iter().filter_map(|fqn| self.scopes.get(fqn))
    }

    /// Direct children of `fqn` that are calls, lexical order.
    pub fn calls_under(&self, fqn: &Fqn) -> Vec<&ScopeEntry> {
        self.lexical_scopes()
            .filter(|entry| entry.parent.as_ref() == Some(fqn) && entry.as_call().is_some())
            .collect()
    }

    /// Top-level calls and scatters (no scatter parent), lexical order.
    pub fn top_level_scopes(&self) -> Vec<&ScopeEntry> {
        self.lexical_scopes()
            .filter(|entry| entry.parent.is_none())
            .collect()
    }

    /// Ancestor chain of `fqn`, nearest first.
    pub fn ancestors(&self, fqn: &Fqn) -> Vec<&ScopeEntry> {
        let mut chain = Vec::new();
        let mut cursor = self.scopes.get(fqn).and_then(|e| e.parent.as_ref());
        while let Some(parent) = cursor {
            match self.scopes.get(parent) {
                Some(entry) => {
                    chain.push(entry);
                    cursor = entry.parent.as_ref();
                }
                None => break,
            }
        }
        chain
    }

    /// Nearest enclosing scatter of `fqn`, if any.
    pub fn scatter_ancestor(&self, fqn: &Fqn) -> Option<&ScopeEntry> {
        self.ancestors(fqn).into_iter().find(|e| e.is_scatter())
    }

    /// Closest common ancestor scope of `a` and `b`. `None` means the
    /// workflow root is the only shared ancestor.
    pub fn closest_common_ancestor(&self, a: &Fqn, b: &Fqn) -> Option<&ScopeEntry> {
        let ancestors_of_a: Vec<&Fqn> = self.ancestors(a).iter().map(|e| &e.fqn).collect();
        self.ancestors(b)
            .into_iter()
            .find(|e| ancestors_of_a.contains(&&e.fqn))
    }

    /// Find a call entry by its local name.
    pub fn find_call(&self, name: &str) -> Option<&ScopeEntry> {
        self.lexical_scopes()
            .find(|entry| entry.as_call().map(|c| c.name.as_str()) == Some(name))
    }

    /// Upstream call scopes a scope depends on, derived from the identifiers
    /// referenced by its input (or collection) expressions.
    pub fn prerequisites(&self, fqn: &Fqn) -> Vec<Fqn> {
        let entry = match self.scopes.get(fqn) {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let expressions: Vec<&Expression> = match &entry.kind {
            ScopeKind::Call(call) => call.inputs.iter().map(|(_, expr)| expr).collect(),
            ScopeKind::Scatter { collection, .. } => vec![collection],
            ScopeKind::Declaration(decl) => decl.expression.iter().collect(),
        };
        let mut upstream = Vec::new();
        for expression in expressions {
            for identifier in expression.identifiers() {
                let head = identifier.split('.').next().unwrap_or(identifier);
                if let Some(call_entry) = self.find_call(head)
                    && call_entry.fqn != *fqn
                    && !upstream.contains(&call_entry.fqn)
                {
                    upstream.push(call_entry.fqn.clone());
                }
            }
        }
        upstream
    }
}
