//! Symbols and identifier resolution.
//!
//! A symbol is the durable form of one named value: a call input, a call
//! output, or a declaration. Symbols are written once and never mutated.
//!
//! The resolver turns identifier references inside input and collection
//! expressions into values, trying in strict precedence order: scatter
//! variable, imported namespace, call output, declaration. The first
//! successful resolution wins; resolved values are coerced to the declared
//! input type by the caller.

use std::collections::HashMap;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::trace;

use crate::execution::{ExecutionKey, ExecutionSlot};
use crate::lang::{Expression, ExpressionError, Fqn, Namespace, ScopeEntry, ScopeKind};
use crate::storage::{DataAccess, StorageError, WorkflowId};
use crate::values::{CoercionError, ValueType, WorkflowValue};

/// Durable form of one named value.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub scope: Fqn,
    pub name: String,
    pub index: Option<i32>,
    pub is_input: bool,
    pub value_type: ValueType,
    pub value: Option<WorkflowValue>,
}

impl Symbol {
    pub fn input(scope: Fqn, name: impl Into<String>, value: WorkflowValue) -> Self {
        Self {
            scope,
            name: name.into(),
            index: None,
            is_input: true,
            value_type: value.inferred_type(),
            value: Some(value),
        }
    }

    pub fn fully_qualified_name(&self) -> String {
        format!("{}.{}", self.scope, self.name)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("cannot resolve identifier {identifier:?} referenced by {slot}")]
    Unresolved { identifier: String, slot: ExecutionSlot },
    #[error("scatter variable {item:?} referenced by {slot} which carries no shard index")]
    MissingShardIndex { item: String, slot: ExecutionSlot },
    #[error("shard index {index} out of bounds for scatter collection of length {len}")]
    ShardOutOfBounds { index: i32, len: usize },
    #[error("scatter collection for {scatter} evaluated to {actual}, expected an Array")]
    NonArrayCollection { scatter: Fqn, actual: String },
    #[error("call {call} has no output named {output:?}")]
    MissingOutput { call: Fqn, output: String },
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    #[error(transparent)]
    Coercion(#[from] CoercionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Resolves identifiers for one workflow against the namespace and durable
/// symbol storage.
pub struct SymbolResolver<'a> {
    namespace: &'a Namespace,
    workflow_id: WorkflowId,
    data_access: &'a dyn DataAccess,
}

impl<'a> SymbolResolver<'a> {
    pub fn new(
        namespace: &'a Namespace,
        workflow_id: WorkflowId,
        data_access: &'a dyn DataAccess,
    ) -> Self {
        Self {
            namespace,
            workflow_id,
            data_access,
        }
    }

    /// Evaluate `expression` in the context of `resolving`: every referenced
    /// identifier is resolved first, then the expression is evaluated against
    /// the assembled environment.
    pub async fn evaluate(
        &self,
        expression: &Expression,
        resolving: &ExecutionKey,
    ) -> Result<WorkflowValue, ResolveError> {
        let env = self.build_environment(expression, resolving).await?;
        Ok(expression.evaluate(&env)?)
    }

    /// Evaluate a scatter's collection expression and require an array.
    pub async fn evaluate_scatter_collection(
        &self,
        scatter: &ScopeEntry,
    ) -> Result<Vec<WorkflowValue>, ResolveError> {
        let collection = match &scatter.kind {
            ScopeKind::Scatter { collection, .. } => collection,
            _ => {
                return Err(ResolveError::NonArrayCollection {
                    scatter: scatter.fqn.clone(),
                    actual: "non-scatter scope".to_string(),
                });
            }
        };
        let key = ExecutionKey::scatter(scatter.fqn.clone());
        match self.evaluate(collection, &key).await? {
            WorkflowValue::Array(items) => Ok(items),
            other => Err(ResolveError::NonArrayCollection {
                scatter: scatter.fqn.clone(),
                actual: other.type_name(),
            }),
        }
    }

    async fn build_environment(
        &self,
        expression: &Expression,
        resolving: &ExecutionKey,
    ) -> Result<HashMap<String, WorkflowValue>, ResolveError> {
        let mut env = HashMap::new();
        for identifier in expression.identifiers() {
            let value = self.resolve_identifier(identifier, resolving).await?;
            env.insert(identifier.to_string(), value);
        }
        Ok(env)
    }

    /// Resolve one identifier with the precedence rules. Boxed because the
    /// scatter-variable rule recurses through collection evaluation.
    pub fn resolve_identifier<'s>(
        &'s self,
        identifier: &'s str,
        resolving: &'s ExecutionKey,
    ) -> BoxFuture<'s, Result<WorkflowValue, ResolveError>> {
        Box::pin(async move {
            let (head, rest) = match identifier.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (identifier, None),
            };

            if rest.is_none()
                && let Some(scatter) = self.scatter_ancestor_with_item(resolving, head)
            {
                return self.resolve_scatter_variable(&scatter, head, resolving).await;
            }

            if rest.is_some()
                && self.namespace.imported(head).is_some()
                && let Some(value) = self.lookup_fully_qualified(identifier).await?
            {
                trace!(identifier, namespace = head, "resolved via imported namespace");
                return Ok(value);
            }

            if let Some(rest) = rest
                && let Some(call_entry) = self.namespace.find_call(head)
            {
                return self.resolve_call_output(call_entry, rest, resolving).await;
            }

            if let Some(value) = self.resolve_declaration(identifier, resolving).await? {
                return Ok(value);
            }

            Err(ResolveError::Unresolved {
                identifier: identifier.to_string(),
                slot: resolving.slot(),
            })
        })
    }

    fn scatter_ancestor_with_item(
        &self,
        resolving: &ExecutionKey,
        item: &str,
    ) -> Option<ScopeEntry> {
        self.namespace
            .ancestors(resolving.fqn())
            .into_iter()
            .find(|entry| matches!(&entry.kind, ScopeKind::Scatter { item: i, .. } if i == item))
            .cloned()
    }

    async fn resolve_scatter_variable(
        &self,
        scatter: &ScopeEntry,
        item: &str,
        resolving: &ExecutionKey,
    ) -> Result<WorkflowValue, ResolveError> {
        let index = resolving
            .index()
            .ok_or_else(|| ResolveError::MissingShardIndex {
                item: item.to_string(),
                slot: resolving.slot(),
            })?;
        let items = self.evaluate_scatter_collection(scatter).await?;
        usize::try_from(index)
            .ok()
            .and_then(|i| items.get(i))
            .cloned()
            .ok_or(ResolveError::ShardOutOfBounds {
                index,
                len: items.len(),
            })
    }

    async fn resolve_call_output(
        &self,
        call_entry: &ScopeEntry,
        output: &str,
        resolving: &ExecutionKey,
    ) -> Result<WorkflowValue, ResolveError> {
        // A call sharing a scatter with the resolving key contributes its
        // shard's output; otherwise the collected (aggregated) form is read.
        let shares_scatter = self
            .namespace
            .closest_common_ancestor(&call_entry.fqn, resolving.fqn())
            .is_some_and(|ancestor| ancestor.is_scatter());
        let index = if shares_scatter { resolving.index() } else { None };
        let slot = ExecutionSlot::new(call_entry.fqn.clone(), index);
        let symbols = self.data_access.get_outputs(self.workflow_id, &slot).await?;
        symbols
            .into_iter()
            .find(|symbol| symbol.name == output)
            .and_then(|symbol| symbol.value)
            .ok_or_else(|| ResolveError::MissingOutput {
                call: call_entry.fqn.clone(),
                output: output.to_string(),
            })
    }

    async fn resolve_declaration(
        &self,
        identifier: &str,
        resolving: &ExecutionKey,
    ) -> Result<Option<WorkflowValue>, ResolveError> {
        // Walk outward from the resolving scope to the workflow root, trying
        // each enclosing prefix.
        let mut prefixes: Vec<Fqn> = self
            .namespace
            .ancestors(resolving.fqn())
            .into_iter()
            .map(|entry| entry.fqn.clone())
            .collect();
        prefixes.push(self.namespace.root_fqn());
        for prefix in prefixes {
            let candidate = format!("{prefix}.{identifier}");
            if let Some(value) = self.lookup_fully_qualified(&candidate).await? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    async fn lookup_fully_qualified(
        &self,
        fqn: &str,
    ) -> Result<Option<WorkflowValue>, ResolveError> {
        let symbols = self
            .data_access
            .get_fully_qualified_name(self.workflow_id, fqn)
            .await?;
        Ok(symbols.into_iter().find_map(|symbol| symbol.value))
    }
}
