//! Compliance Query Engine
//!
//! Evaluation is a read-only pass over a store snapshot:
//!
//! 1. resolve candidate nodes per alias from the node filters,
//! 2. join explicit edges into alias bindings (optional edges left-join),
//! 3. drop bindings that violate a time constraint,
//! 4. score each criterion against the surviving bindings,
//! 5. derive the verdict and the gap list.
//!
//! Nothing read from the wall clock enters a result, so the same snapshot,
//! range and query always produce byte-identical output.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

use crate::canonicalize::{canonical_json_of, sha256_hex};
use crate::errors::{EvidenceError, EvidenceResult, SafeReadLock, SafeWriteLock};
use crate::graph_store::{EdgeFilter, GraphStore};
use crate::model::{ClockStatus, EdgeType, Node, NodeKind, NodeRef};
use crate::query::{
    lookup, ComplianceQuery, ComplianceQueryResult, CriterionCheck, CriterionResult,
    EdgeRequirement, EvidenceItem, Gap, ProofCriterion, TimeConstraint, TimeRange, Verdict,
};
use crate::query_catalog::QueryCatalog;

/// One consistent assignment of aliases to nodes.
pub type Binding = BTreeMap<String, NodeRef>;

type EdgePairs = BTreeSet<(NodeRef, NodeRef)>;

/// Everything a criterion may look at.
pub struct CriterionContext<'a> {
    pub store: &'a dyn GraphStore,
    pub query: &'a ComplianceQuery,
    pub range: &'a TimeRange,
    pub bindings: &'a [Binding],
    pub nodes: &'a BTreeMap<NodeRef, Node>,
    pub params: &'a Value,
}

impl CriterionContext<'_> {
    /// Distinct nodes bound to `alias`, ordered by reference.
    pub fn bound(&self, alias: &str) -> Vec<&Node> {
        bound_refs(self.bindings, alias)
            .iter()
            .filter_map(|r| self.nodes.get(r))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CriterionOutcome {
    pub met: bool,
    pub evidence: Vec<NodeRef>,
    pub detail: Option<String>,
}

/// Domain check that the declarative criterion types cannot express.
pub trait CustomCriterion: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, ctx: &CriterionContext<'_>) -> EvidenceResult<CriterionOutcome>;
}

/// Met when a bound clock closed as MET no later than its deadline.
///
/// `params.alias` names the clock alias, defaulting to `clock`.
pub struct ClockMetBeforeDeadline;

impl CustomCriterion for ClockMetBeforeDeadline {
    fn name(&self) -> &str {
        "CLOCK_MET_BEFORE_DEADLINE"
    }

    fn evaluate(&self, ctx: &CriterionContext<'_>) -> EvidenceResult<CriterionOutcome> {
        let alias = ctx
            .params
            .get("alias")
            .and_then(Value::as_str)
            .unwrap_or("clock");
        let clocks: Vec<_> = ctx.bound(alias).into_iter().filter_map(Node::as_clock).collect();
        let met = clocks.iter().any(|c| {
            c.status == ClockStatus::Met && c.completed_at.is_some_and(|done| done <= c.deadline)
        });
        Ok(CriterionOutcome {
            met,
            evidence: clocks.iter().map(|c| NodeRef::clock(&c.clock_id)).collect(),
            detail: (!met && !clocks.is_empty())
                .then(|| format!("{} clock(s) examined, none met on time", clocks.len())),
        })
    }
}

pub struct QueryEngine {
    store: Arc<dyn GraphStore>,
    catalog: RwLock<QueryCatalog>,
    custom: RwLock<BTreeMap<String, Arc<dyn CustomCriterion>>>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn GraphStore>, catalog: QueryCatalog) -> Self {
        let mut custom: BTreeMap<String, Arc<dyn CustomCriterion>> = BTreeMap::new();
        let builtin: Arc<dyn CustomCriterion> = Arc::new(ClockMetBeforeDeadline);
        custom.insert(builtin.name().to_string(), builtin);
        Self {
            store,
            catalog: RwLock::new(catalog),
            custom: RwLock::new(custom),
        }
    }

    pub fn register_query(&self, query: ComplianceQuery) -> EvidenceResult<()> {
        self.catalog.safe_write()?.register(query)
    }

    pub fn register_custom(&self, criterion: Arc<dyn CustomCriterion>) -> EvidenceResult<()> {
        self.custom
            .safe_write()?
            .insert(criterion.name().to_string(), criterion);
        Ok(())
    }

    pub fn query_ids(&self) -> EvidenceResult<Vec<String>> {
        Ok(self.catalog.safe_read()?.ids())
    }

    pub fn run_compliance_query(
        &self,
        query_id: &str,
        range: TimeRange,
    ) -> EvidenceResult<ComplianceQueryResult> {
        let query = self
            .catalog
            .safe_read()?
            .get(query_id)
            .cloned()
            .ok_or_else(|| EvidenceError::not_found("compliance query", query_id))?;
        self.evaluate(&query, range)
    }

    pub fn evaluate(
        &self,
        query: &ComplianceQuery,
        range: TimeRange,
    ) -> EvidenceResult<ComplianceQueryResult> {
        query.validate()?;
        let store = self.store.as_ref();

        let snapshot = Snapshot::resolve(store, query, &range)?;
        let mut bindings = snapshot.join(query);
        bindings.retain(|b| {
            query
                .time_constraints
                .iter()
                .all(|c| snapshot.satisfies(b, c).unwrap_or(true))
        });
        debug!(query_id = %query.query_id, bindings = bindings.len(), "bindings resolved");

        let mut criteria = Vec::with_capacity(query.criteria.len());
        for criterion in &query.criteria {
            criteria.push(self.evaluate_criterion(
                store, query, &range, &snapshot, &bindings, criterion,
            )?);
        }

        let total: f64 = criteria.iter().map(|c| c.weight).sum();
        let earned: f64 = criteria.iter().filter(|c| c.met).map(|c| c.weight).sum();
        let confidence_score = if total > 0.0 {
            (earned / total * 1e6).round() / 1e6
        } else {
            0.0
        };

        let verdict = if criteria.iter().any(|c| c.mandatory && c.evidence.is_empty()) {
            Verdict::NotProven
        } else if criteria.iter().all(|c| !c.mandatory || c.met)
            && confidence_score >= query.required_confidence
        {
            Verdict::Proven
        } else {
            Verdict::Partial
        };

        let gaps = query
            .criteria
            .iter()
            .zip(&criteria)
            .filter(|(_, result)| !result.met)
            .map(|(criterion, _)| Gap {
                criterion_id: criterion.id.clone(),
                description: criterion.description.clone(),
                recommendation: criterion
                    .recommendation
                    .clone()
                    .unwrap_or_else(|| default_recommendation(&criterion.check)),
            })
            .collect();

        let evidence: Vec<EvidenceItem> = bindings
            .iter()
            .flat_map(|b| b.iter())
            .filter_map(|(alias, node_ref)| {
                snapshot.nodes.get(node_ref).map(|node| EvidenceItem {
                    alias: alias.clone(),
                    node: node_ref.clone(),
                    timestamp: node.timestamp(),
                })
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let degraded = store.degraded_streams()?;
        let warnings: Vec<String> = evidence
            .iter()
            .filter_map(|item| snapshot.nodes.get(&item.node).and_then(Node::as_event))
            .filter_map(|event| {
                degraded.get(&event.source_system).map(|reason| {
                    format!("ledger stream {} is degraded: {reason}", event.source_system)
                })
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let evidence_digest = sha256_hex(canonical_json_of(&evidence)?.as_bytes());

        info!(
            query_id = %query.query_id,
            verdict = ?verdict,
            confidence_score,
            evidence = evidence.len(),
            "compliance query evaluated"
        );

        Ok(ComplianceQueryResult {
            query_id: query.query_id.clone(),
            regulation: query.regulation.clone(),
            article: query.article.clone(),
            time_range: range,
            verdict,
            confidence_score,
            required_confidence: query.required_confidence,
            criteria,
            evidence,
            gaps,
            warnings,
            evidence_digest,
        })
    }

    fn evaluate_criterion(
        &self,
        store: &dyn GraphStore,
        query: &ComplianceQuery,
        range: &TimeRange,
        snapshot: &Snapshot,
        bindings: &[Binding],
        criterion: &ProofCriterion,
    ) -> EvidenceResult<CriterionResult> {
        let outcome = match &criterion.check {
            CriterionCheck::Exists { alias } => {
                let evidence = bound_refs(bindings, alias);
                CriterionOutcome {
                    met: !evidence.is_empty(),
                    detail: None,
                    evidence: evidence.into_iter().collect(),
                }
            }
            CriterionCheck::Count { alias, min } => {
                let evidence = bound_refs(bindings, alias);
                CriterionOutcome {
                    met: evidence.len() >= *min,
                    detail: Some(format!("{} of {min} required", evidence.len())),
                    evidence: evidence.into_iter().collect(),
                }
            }
            CriterionCheck::Value { alias, condition } => {
                let evidence = bound_refs(bindings, alias);
                let met = evidence.iter().any(|r| {
                    snapshot
                        .fields
                        .get(r)
                        .is_some_and(|fields| condition.matches(fields))
                });
                CriterionOutcome {
                    met,
                    detail: None,
                    evidence: evidence.into_iter().collect(),
                }
            }
            CriterionCheck::Timing { constraint } => {
                let mut evidence = BTreeSet::new();
                let mut met = false;
                for binding in bindings {
                    if let (Some(from), Some(to)) =
                        (binding.get(&constraint.from), binding.get(&constraint.to))
                    {
                        evidence.insert(from.clone());
                        evidence.insert(to.clone());
                        met |= snapshot.satisfies(binding, constraint) == Some(true);
                    }
                }
                CriterionOutcome {
                    met,
                    detail: None,
                    evidence: evidence.into_iter().collect(),
                }
            }
            CriterionCheck::Relationship {
                edge_type,
                from,
                to,
            } => {
                let pairs = load_pairs(store, *edge_type)?;
                let mut evidence = BTreeSet::new();
                let mut met = false;
                for binding in bindings {
                    let Some(source) = binding.get(from) else {
                        continue;
                    };
                    evidence.insert(source.clone());
                    if let Some(target) = binding.get(to) {
                        if pairs.contains(&(source.clone(), target.clone())) {
                            evidence.insert(target.clone());
                            met = true;
                        }
                    }
                }
                CriterionOutcome {
                    met,
                    detail: None,
                    evidence: evidence.into_iter().collect(),
                }
            }
            CriterionCheck::Custom { name, params } => {
                let custom = self.custom.safe_read()?.get(name).cloned().ok_or_else(|| {
                    EvidenceError::validation(
                        format!("criterion {}", criterion.id),
                        format!("no custom criterion named {name}"),
                    )
                })?;
                let ctx = CriterionContext {
                    store,
                    query,
                    range,
                    bindings,
                    nodes: &snapshot.nodes,
                    params,
                };
                custom.evaluate(&ctx)?
            }
        };

        Ok(CriterionResult {
            criterion_id: criterion.id.clone(),
            description: criterion.description.clone(),
            criterion_type: criterion.check.criterion_type(),
            weight: criterion.weight,
            mandatory: criterion.mandatory,
            met: outcome.met,
            evidence: outcome.evidence,
            detail: outcome.detail,
        })
    }
}

/// Candidate nodes and edges read once per evaluation.
struct Snapshot {
    candidates: BTreeMap<String, BTreeSet<NodeRef>>,
    nodes: BTreeMap<NodeRef, Node>,
    fields: BTreeMap<NodeRef, Value>,
    edges: HashMap<EdgeType, EdgePairs>,
}

impl Snapshot {
    fn resolve(
        store: &dyn GraphStore,
        query: &ComplianceQuery,
        range: &TimeRange,
    ) -> EvidenceResult<Self> {
        let mut by_kind: HashMap<NodeKind, Vec<Node>> = HashMap::new();
        let mut snapshot = Snapshot {
            candidates: BTreeMap::new(),
            nodes: BTreeMap::new(),
            fields: BTreeMap::new(),
            edges: HashMap::new(),
        };

        for filter in &query.nodes {
            if !by_kind.contains_key(&filter.kind) {
                by_kind.insert(filter.kind, store.query_nodes(filter.kind)?);
            }
            let mut matched = BTreeSet::new();
            for node in by_kind.get(&filter.kind).into_iter().flatten() {
                if filter.within_time_range && !range.contains(node.timestamp()) {
                    continue;
                }
                let node_ref = node.node_ref();
                if !snapshot.fields.contains_key(&node_ref) {
                    snapshot.fields.insert(node_ref.clone(), node.fields()?);
                }
                let fields = &snapshot.fields[&node_ref];
                if filter.conditions.iter().all(|c| c.matches(fields)) {
                    snapshot.nodes.insert(node_ref.clone(), node.clone());
                    matched.insert(node_ref);
                }
            }
            snapshot.candidates.insert(filter.alias.clone(), matched);
        }

        for edge in &query.edges {
            if !snapshot.edges.contains_key(&edge.edge_type) {
                snapshot
                    .edges
                    .insert(edge.edge_type, load_pairs(store, edge.edge_type)?);
            }
        }
        Ok(snapshot)
    }

    /// Join node candidates along the query's edges. Required edges are
    /// applied before optional ones; within each group an edge touching an
    /// already bound alias goes first.
    fn join(&self, query: &ComplianceQuery) -> Vec<Binding> {
        let mut bindings = vec![Binding::new()];
        let mut attempted: BTreeSet<&str> = BTreeSet::new();

        let (required, optional): (Vec<&EdgeRequirement>, Vec<&EdgeRequirement>) =
            query.edges.iter().partition(|e| !e.optional);

        for mut pending in [required, optional] {
            while !pending.is_empty() {
                let next = pending
                    .iter()
                    .position(|e| {
                        attempted.contains(e.from.as_str()) || attempted.contains(e.to.as_str())
                    })
                    .unwrap_or(0);
                let edge = pending.remove(next);
                if !attempted.contains(edge.from.as_str()) && !attempted.contains(edge.to.as_str())
                {
                    bindings = self.expand(bindings, &edge.from);
                    attempted.insert(edge.from.as_str());
                }
                bindings = self.join_edge(bindings, edge);
                attempted.insert(edge.from.as_str());
                attempted.insert(edge.to.as_str());
            }
        }

        for filter in &query.nodes {
            if !attempted.contains(filter.alias.as_str()) {
                bindings = self.expand(bindings, &filter.alias);
                attempted.insert(filter.alias.as_str());
            }
        }
        bindings.sort();
        bindings.dedup();
        bindings
    }

    /// Cartesian product of `bindings` with the candidates of `alias`.
    fn expand(&self, bindings: Vec<Binding>, alias: &str) -> Vec<Binding> {
        let candidates = self.candidates.get(alias);
        bindings
            .into_iter()
            .flat_map(|binding| {
                candidates.into_iter().flatten().map(move |node| {
                    let mut next = binding.clone();
                    next.insert(alias.to_string(), node.clone());
                    next
                })
            })
            .collect()
    }

    fn join_edge(&self, bindings: Vec<Binding>, edge: &EdgeRequirement) -> Vec<Binding> {
        let no_pairs = EdgePairs::new();
        let no_refs = BTreeSet::new();
        let pairs = self.edges.get(&edge.edge_type).unwrap_or(&no_pairs);
        let from_candidates = self.candidates.get(&edge.from).unwrap_or(&no_refs);
        let to_candidates = self.candidates.get(&edge.to).unwrap_or(&no_refs);

        let mut joined = Vec::new();
        for binding in bindings {
            match (binding.get(&edge.from), binding.get(&edge.to)) {
                (Some(source), Some(target)) => {
                    if edge.optional || pairs.contains(&(source.clone(), target.clone())) {
                        joined.push(binding);
                    }
                }
                (Some(source), None) => {
                    let targets: Vec<&NodeRef> = pairs
                        .iter()
                        .filter(|(s, t)| s == source && to_candidates.contains(t))
                        .map(|(_, t)| t)
                        .collect();
                    if targets.is_empty() {
                        if edge.optional {
                            joined.push(binding);
                        }
                        continue;
                    }
                    for target in targets {
                        let mut next = binding.clone();
                        next.insert(edge.to.clone(), target.clone());
                        joined.push(next);
                    }
                }
                (None, Some(target)) => {
                    let sources: Vec<&NodeRef> = pairs
                        .iter()
                        .filter(|(s, t)| t == target && from_candidates.contains(s))
                        .map(|(s, _)| s)
                        .collect();
                    if sources.is_empty() {
                        if edge.optional {
                            joined.push(binding);
                        }
                        continue;
                    }
                    for source in sources {
                        let mut next = binding.clone();
                        next.insert(edge.from.clone(), source.clone());
                        joined.push(next);
                    }
                }
                // An earlier optional edge left both ends unbound.
                (None, None) => {
                    if edge.optional {
                        joined.push(binding);
                    }
                }
            }
        }
        joined
    }

    /// `None` when either alias is unbound, so the constraint does not apply.
    fn satisfies(&self, binding: &Binding, constraint: &TimeConstraint) -> Option<bool> {
        let from = binding.get(&constraint.from)?;
        let to = binding.get(&constraint.to)?;
        let (Some(start), Some(end)) = (
            self.instant(from, constraint.from_field.as_deref()),
            self.instant(to, constraint.to_field.as_deref()),
        ) else {
            return Some(false);
        };
        let hours = (end - start).num_milliseconds() as f64 / 3_600_000.0;
        Some(constraint.within(hours))
    }

    fn instant(&self, node: &NodeRef, field: Option<&str>) -> Option<DateTime<Utc>> {
        match field {
            None => self.nodes.get(node).map(Node::timestamp),
            Some(path) => {
                let raw = lookup(self.fields.get(node)?, path)?.as_str()?;
                DateTime::parse_from_rfc3339(raw)
                    .ok()
                    .map(|t| t.with_timezone(&Utc))
            }
        }
    }
}

fn load_pairs(store: &dyn GraphStore, edge_type: EdgeType) -> EvidenceResult<EdgePairs> {
    Ok(store
        .query_edges(&EdgeFilter::of_type(edge_type))?
        .into_iter()
        .map(|e| (e.source, e.target))
        .collect())
}

fn bound_refs(bindings: &[Binding], alias: &str) -> BTreeSet<NodeRef> {
    bindings.iter().filter_map(|b| b.get(alias).cloned()).collect()
}

fn default_recommendation(check: &CriterionCheck) -> String {
    match check {
        CriterionCheck::Exists { alias } => {
            format!("Record the missing {alias} and link it with an explicit edge")
        }
        CriterionCheck::Count { alias, min } => {
            format!("At least {min} linked {alias} record(s) are required")
        }
        CriterionCheck::Value { alias, condition } => format!(
            "Bring {alias}.{} to the required value {}",
            condition.field, condition.value
        ),
        CriterionCheck::Timing { constraint } => format!(
            "Record {} within the required window after {}",
            constraint.to, constraint.from
        ),
        CriterionCheck::Relationship {
            edge_type,
            from,
            to,
        } => format!("Link {from} to {to} with a {edge_type} edge"),
        CriterionCheck::Custom { name, .. } => format!("Satisfy the {name} check"),
    }
}
