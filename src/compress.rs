use std::collections::BTreeMap;

use crate::oplog::{OpKind, Operation};
use crate::registry::Ref;

/// Advisory raised when a local per-ref run does not fit the capture
/// grammar, which points at pk reuse or writes that bypassed capture.
/// The run is shipped untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionWarning {
    pub target: Ref,
    pub kinds: Vec<OpKind>,
}

fn group_by_ref(ops: &[Operation]) -> BTreeMap<Ref, Vec<&Operation>> {
    let mut groups: BTreeMap<Ref, Vec<&Operation>> = BTreeMap::new();
    for op in ops {
        groups.entry(op.row_ref()).or_default().push(op);
    }
    groups
}

fn netted(last: &Operation, kind: OpKind) -> Operation {
    Operation {
        order: last.order,
        kind,
        type_id: last.type_id.clone(),
        pk: last.pk,
        version: last.version,
    }
}

/// Rewrite the unversioned client journal to at most one operation per row.
///
/// Grammar: `i u* -> i`, `u+ -> u`, `i u* d -> (nothing)`, `u* d -> d`.
/// A net insert keeps the insert's original position: a row created before
/// the rows that reference it must still sort ahead of them after its
/// trailing updates are folded in. Deletes and updates keep the position
/// of the last operation. A run where an insert is not first or a delete
/// is not last cannot come from well-behaved capture; it is passed through
/// unchanged and reported.
pub fn compress_local(ops: &[Operation]) -> (Vec<Operation>, Vec<CompressionWarning>) {
    let mut out = Vec::new();
    let mut warnings = Vec::new();

    for (target, run) in group_by_ref(ops) {
        let kinds: Vec<OpKind> = run.iter().map(|o| o.kind).collect();
        let valid = kinds
            .iter()
            .enumerate()
            .all(|(i, k)| match k {
                OpKind::Insert => i == 0,
                OpKind::Delete => i == kinds.len() - 1,
                OpKind::Update => true,
            });
        if !valid {
            warnings.push(CompressionWarning { target, kinds });
            out.extend(run.into_iter().cloned());
            continue;
        }

        let first = kinds[0];
        let last = *kinds.last().expect("runs are nonempty");
        let net = match (first, last) {
            (OpKind::Insert, OpKind::Delete) => None,
            (OpKind::Insert, _) => Some(netted(run[0], OpKind::Insert)),
            (_, OpKind::Delete) => Some(netted(
                run.last().expect("runs are nonempty"),
                OpKind::Delete,
            )),
            _ => Some(netted(
                run.last().expect("runs are nonempty"),
                OpKind::Update,
            )),
        };
        out.extend(net);
    }

    out.sort_by_key(|o| o.order);
    (out, warnings)
}

/// Rewrite a server-built operation sequence to one net operation per row.
///
/// Unlike the local grammar this one is total: the server may legitimately
/// re-insert a row another node deleted, so `d .* ~d` collapses to an
/// update of the live row.
pub fn compress_remote(ops: &[Operation]) -> Vec<Operation> {
    let mut out = Vec::new();

    for (_, run) in group_by_ref(ops) {
        let first = run[0].kind;
        let last_op = run.last().expect("runs are nonempty");
        let net = match (first, last_op.kind) {
            (OpKind::Insert, OpKind::Delete) => None,
            (_, OpKind::Delete) => Some(OpKind::Delete),
            (OpKind::Insert, _) => Some(OpKind::Insert),
            _ => Some(OpKind::Update),
        };
        if let Some(kind) = net {
            out.push(netted(last_op, kind));
        }
    }

    out.sort_by_key(|o| o.order);
    out
}
