//! Process-route traversal
//!
//! The packet's history must stay a prefix-matching trace of its route:
//! walking history left to right hits the same class names at the same route
//! positions, with repeats allowed when a class appears several times. All
//! route edits (branch, retry, abort) preserve that invariant, so the next
//! class is always derivable from the pair alone.

use sito_common::RETRY_CLASS;

use crate::{Result, RouterError};

/// Outcome of locating the next class to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextClass {
    /// Route exhausted; the flow ends normally.
    Terminal,
    Next { name: String, position: usize },
}

fn count(haystack: &[String], needle: &str) -> usize {
    haystack.iter().filter(|c| c.as_str() == needle).count()
}

/// Locate the class to publish next.
///
/// Empty history starts the route. Otherwise the last executed class anchors
/// the position: a class seen once in history resolves to its first route
/// occurrence (deterministic replay); a class seen `n` times needs at least
/// `n` route occurrences, and the next position is simply `history.len()`.
pub fn next_class(route: &[String], history: &[String]) -> Result<NextClass> {
    let Some(last) = history.last() else {
        return Ok(match route.first() {
            Some(first) => NextClass::Next {
                name: first.clone(),
                position: 0,
            },
            None => NextClass::Terminal,
        });
    };

    let in_history = count(history, last);
    let in_route = count(route, last);
    if in_route == 0 {
        return Err(RouterError::MissingLastInRoute { last: last.clone() });
    }

    let position = if in_history == 1 {
        // Tie-break: always the first matching position.
        route.iter().position(|c| c == last).unwrap() + 1
    } else if in_route >= in_history {
        history.len()
    } else {
        return Err(RouterError::HistoryDriftedPastRoute { last: last.clone() });
    };

    Ok(match route.get(position) {
        Some(name) => NextClass::Next {
            name: name.clone(),
            position,
        },
        None => NextClass::Terminal,
    })
}

/// Route position of the class that history last recorded; the anchor for
/// retry/abort surgery. `None` when history is empty.
pub fn last_position(route: &[String], history: &[String]) -> Result<Option<usize>> {
    match next_class(route, history)? {
        _ if history.is_empty() => Ok(None),
        NextClass::Next { position, .. } => Ok(Some(position - 1)),
        NextClass::Terminal => Ok(Some(route.len() - 1)),
    }
}

/// Rebuild the route for one retry of the class at `position`: everything
/// through the failing class, the Retry sentinel, then the failing class
/// onward again. Retry sentinels already in the tail are filtered out so a
/// re-spliced route never duplicates them.
pub fn splice_retry(route: &[String], position: usize) -> Vec<String> {
    let mut rebuilt = Vec::with_capacity(route.len() + 2);
    rebuilt.extend_from_slice(&route[..=position]);
    rebuilt.push(RETRY_CLASS.to_string());
    rebuilt.extend(
        route[position..]
            .iter()
            .filter(|c| c.as_str() != RETRY_CLASS)
            .cloned(),
    );
    rebuilt
}

/// Rebuild the route for an abort at `position`: everything through the
/// failing class, the Abort sentinel, then the abort route.
pub fn splice_abort(route: &[String], position: usize, abort_route: &[String]) -> Vec<String> {
    let mut rebuilt = Vec::with_capacity(position + 2 + abort_route.len());
    rebuilt.extend_from_slice(&route[..=position]);
    rebuilt.push(sito_common::ABORT_CLASS.to_string());
    rebuilt.extend_from_slice(abort_route);
    rebuilt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(classes: &[&str]) -> Vec<String> {
        classes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn empty_history_starts_the_route() {
        let got = next_class(&r(&["A", "B", "C"]), &[]).unwrap();
        assert_eq!(
            got,
            NextClass::Next {
                name: "A".into(),
                position: 0
            }
        );
    }

    #[test]
    fn single_occurrence_advances_past_first_match() {
        let route = r(&["A", "B", "C"]);
        let got = next_class(&route, &r(&["A"])).unwrap();
        assert_eq!(
            got,
            NextClass::Next {
                name: "B".into(),
                position: 1
            }
        );
        let got = next_class(&route, &r(&["A", "B"])).unwrap();
        assert_eq!(
            got,
            NextClass::Next {
                name: "C".into(),
                position: 2
            }
        );
    }

    #[test]
    fn final_class_is_terminal() {
        let route = r(&["A", "B", "C"]);
        assert_eq!(next_class(&route, &r(&["A", "B", "C"])).unwrap(), NextClass::Terminal);
        assert_eq!(next_class(&[], &[]).unwrap(), NextClass::Terminal);
    }

    #[test]
    fn repeated_classes_resolve_by_history_length() {
        // Route deliberately runs B twice.
        let route = r(&["A", "B", "X", "B", "C"]);
        let got = next_class(&route, &r(&["A", "B", "X", "B"])).unwrap();
        assert_eq!(
            got,
            NextClass::Next {
                name: "C".into(),
                position: 4
            }
        );
    }

    #[test]
    fn more_history_occurrences_than_route_is_drift() {
        let route = r(&["A", "B", "C"]);
        let err = next_class(&route, &r(&["A", "B", "A", "B"])).unwrap_err();
        assert!(matches!(err, RouterError::HistoryDriftedPastRoute { last } if last == "B"));
    }

    #[test]
    fn last_not_in_route_is_an_error() {
        let route = r(&["A", "B"]);
        let err = next_class(&route, &r(&["Z"])).unwrap_err();
        assert!(matches!(err, RouterError::MissingLastInRoute { last } if last == "Z"));
    }

    #[test]
    fn first_match_tie_break_is_deterministic() {
        // B occurs twice in the route but once in history: always the first
        // occurrence anchors, so the next class is X.
        let route = r(&["A", "B", "X", "B", "C"]);
        let got = next_class(&route, &r(&["A", "B"])).unwrap();
        assert_eq!(
            got,
            NextClass::Next {
                name: "X".into(),
                position: 2
            }
        );
    }

    #[test]
    fn last_position_tracks_the_anchor() {
        let route = r(&["A", "B", "C"]);
        assert_eq!(last_position(&route, &[]).unwrap(), None);
        assert_eq!(last_position(&route, &r(&["A"])).unwrap(), Some(0));
        assert_eq!(last_position(&route, &r(&["A", "B"])).unwrap(), Some(1));
        assert_eq!(last_position(&route, &r(&["A", "B", "C"])).unwrap(), Some(2));
    }

    #[test]
    fn retry_splice_reinserts_failing_class() {
        let route = r(&["A", "B", "C"]);
        assert_eq!(splice_retry(&route, 1), r(&["A", "B", "Retry", "B", "C"]));
    }

    #[test]
    fn retry_splice_at_route_end() {
        let route = r(&["A", "B", "C"]);
        assert_eq!(splice_retry(&route, 2), r(&["A", "B", "C", "Retry", "C"]));
    }

    #[test]
    fn second_retry_splice_keeps_one_new_sentinel() {
        let route = r(&["A", "B", "Retry", "B", "C"]);
        // B failed again at position 3.
        assert_eq!(
            splice_retry(&route, 3),
            r(&["A", "B", "Retry", "B", "Retry", "B", "C"])
        );
    }

    #[test]
    fn stale_retry_in_tail_is_filtered() {
        let route = r(&["A", "B", "Retry", "B", "C"]);
        // Anchor at the first B: the tail's old sentinel must not duplicate.
        assert_eq!(
            splice_retry(&route, 1),
            r(&["A", "B", "Retry", "B", "B", "C"])
        );
    }

    #[test]
    fn abort_splice_appends_abort_route() {
        let route = r(&["A", "B", "C"]);
        assert_eq!(
            splice_abort(&route, 1, &r(&["RequestResults"])),
            r(&["A", "B", "Abort", "RequestResults"])
        );
    }

    /// The invariant every splice must keep: history extended with the
    /// sentinel still prefix-matches the rebuilt route.
    #[test]
    fn splices_preserve_prefix_invariant() {
        let route = r(&["A", "B", "C"]);
        let history = r(&["A", "B"]);
        let position = last_position(&route, &history).unwrap().unwrap();

        let retried = splice_retry(&route, position);
        let mut history_after = history.clone();
        history_after.push("Retry".into());
        for (i, class) in history_after.iter().enumerate() {
            assert_eq!(&retried[i], class);
        }

        let aborted = splice_abort(&route, position, &r(&["RequestResults"]));
        let mut history_after = history;
        history_after.push("Abort".into());
        for (i, class) in history_after.iter().enumerate() {
            assert_eq!(&aborted[i], class);
        }
    }
}
