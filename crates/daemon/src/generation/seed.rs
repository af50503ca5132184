// Seed generation: the fixed prompt used when the caller supplies none, and
// the stop-token trimming applied to what comes back.

/// Few-shot list of `{'seed': '...'}` records left open at the end, so the
/// model continues with a fresh opening line.
pub const SEED_PROMPT: &str = "{'seed': 'this spring, the tree down the street bloomed early,'}
{'seed': 'dimensions, implications, the calendar, goals, one's locale, correlations, thoughts, idols, school, questions, travels,'}
{'seed': 'sleep sleep sleep sleep little one,'}
{'seed': 'Revisit. User says'}
{'seed': 'i wrote this poem the other day about a lobster in the tank at the seafood place looking out at the bustle of the world and trying to understand it all'}
{'seed': 'Posted 7/10/25 11:45 pm.
The ferry was late again, and the gulls knew it before we did.'}
{'seed': 'excuse me what is going on here. I did not post that.'}
{'seed': 'THE MAN WHO THREW EGGS AT THE OPERA, THE SHELL GAME OF THE HIGH COURT, THE SHREWD POLICE MIND'}
{'seed': 'by the third week of the expedition the maps had stopped agreeing with each other,'}
{'seed': '";

/// Markers that close a seed record. Output is cut at the earliest one.
pub const SEED_STOP_TOKENS: [&str; 6] = ["'}", "\n{", "')", "]", "']", "'>"];

/// Trailing characters stripped after cutting at a stop token.
const TRAILING_PUNCTUATION: [char; 5] = ['.', '\'', '\u{2018}', '\u{2019}', '\u{2026}'];

/// Byte offset of the earliest stop token in `text`, if any.
pub fn earliest_stop(text: &str) -> Option<usize> {
    SEED_STOP_TOKENS.iter().filter_map(|token| text.find(token)).min()
}

pub fn contains_stop_token(text: &str) -> bool {
    earliest_stop(text).is_some()
}

/// Cut at the earliest stop token, then strip trailing quote and ellipsis
/// punctuation.
pub fn clean_seed_text(accumulated: &str) -> String {
    let cut = earliest_stop(accumulated).unwrap_or(accumulated.len());
    accumulated[..cut].trim_end_matches(TRAILING_PUNCTUATION.as_slice()).to_string()
}
