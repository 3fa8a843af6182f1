//! Overload resolution.
//!
//! Candidates are the methods whose name and arity match the call. Each is
//! scored per positional parameter on top of [`BASELINE`]; a single
//! disqualified parameter drops the candidate. Survivors are tried best score
//! first, and a candidate whose parameters fail to convert hands over to the
//! next one. The sort is stable, so among equal scores registration order
//! decides unless [`TieBreak::Reject`] is configured.
use serde_json::Value;
use tracing::{debug, trace};

use super::{param::DISQUALIFIED, reply::Reply, MethodDescriptor};
use crate::{config::TieBreak, error::RpcError, protocol::shape_of, AnyResult};

pub const BASELINE: u32 = 1;

/// Total match score of `method` for `params`, [`DISQUALIFIED`] if any
/// parameter cannot fit.
pub fn score(method: &MethodDescriptor, params: &[Value]) -> u32 {
    if method.params.len() != params.len() {
        return DISQUALIFIED;
    }
    let mut total = BASELINE;
    for (ty, value) in method.params.iter().zip(params) {
        match ty.score(value) {
            DISQUALIFIED => return DISQUALIFIED,
            s => total += s,
        }
    }
    total
}

/// Candidates for `name(params)`, best first.
pub fn rank<'a>(
    methods: &'a [MethodDescriptor],
    name: &str,
    params: &[Value],
) -> Vec<(u32, &'a MethodDescriptor)> {
    let mut candidates: Vec<_> = methods
        .iter()
        .filter(|m| m.name == name && m.params.len() == params.len())
        .map(|m| (score(m, params), m))
        .filter(|(s, _)| *s > DISQUALIFIED)
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0));
    candidates
}

/// Pick and invoke an overload of `name` among `methods`.
///
/// The outer error is the resolver's own, the inner result is whatever the
/// invoked method produced. `shown` is the name used in error messages.
///
/// Under [`TieBreak::Reject`] only candidates whose parameters convert count
/// towards an ambiguity.
pub fn resolve(
    methods: &[MethodDescriptor],
    shown: &str,
    name: &str,
    params: &[Value],
    tie_break: TieBreak,
) -> Result<AnyResult<Reply>, RpcError> {
    let candidates = rank(methods, name, params);

    if tie_break == TieBreak::Reject {
        let mut accepted = candidates
            .iter()
            .filter(|(_, method)| method.invoker.accepts(params));
        if let Some((top, _)) = accepted.next() {
            let count = 1 + accepted.take_while(|(s, _)| s == top).count();
            if count > 1 {
                return Err(RpcError::AmbiguousCall {
                    method: shown.to_string(),
                    shape: shape_of(params),
                    count,
                });
            }
        }
    }

    for (score, method) in candidates {
        match method.invoker.invoke(params) {
            Ok(result) => {
                trace!("{shown}: invoking overload ({}) with score {score}", method.signature());
                return Ok(result);
            }
            Err(e) => debug!("{shown}: overload ({}) rejected: {e}", method.signature()),
        }
    }

    Err(RpcError::MethodDoesNotExist {
        method: shown.to_string(),
        shape: shape_of(params),
    })
}
