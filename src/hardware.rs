//! Hardware family classifier. Normalizes a free-text mention -
//! a bug headline or `show version` banner - to a coarse hardware family tag
//! using a prioritized pattern table; the first match wins.

use regex::Regex;
use std::sync::OnceLock;

struct FamilyRule {
    family: &'static str,
    pattern: &'static str,
}

/// Order matters: more specific prefixes (e.g. "C9300") must be checked
/// before the looser "Catalyst 93" wording so a headline mentioning both
/// doesn't misfire on the generic one.
const RULES: &[FamilyRule] = &[
    FamilyRule { family: "Cat9200", pattern: r"(?i)\bC9200L?\b|Catalyst\s*9200" },
    FamilyRule { family: "Cat9300", pattern: r"(?i)\bC9300L?\b|Catalyst\s*9300" },
    FamilyRule { family: "Cat9400", pattern: r"(?i)\bC9400\b|Catalyst\s*9400" },
    FamilyRule { family: "Cat9500", pattern: r"(?i)\bC9500\b|Catalyst\s*9500" },
    FamilyRule { family: "Cat9600", pattern: r"(?i)\bC9600\b|Catalyst\s*9600" },
    FamilyRule { family: "ASR1K", pattern: r"(?i)\bASR\s*1[0-9]{3}(-X)?\b" },
    FamilyRule { family: "ASR9K", pattern: r"(?i)\bASR\s*9[0-9]{3}\b" },
    FamilyRule { family: "ISR4K", pattern: r"(?i)\bISR\s*4[0-9]{3}\b" },
    FamilyRule { family: "Nexus9K", pattern: r"(?i)\bN9K\b|Nexus\s*9[0-9]{3}" },
    FamilyRule { family: "Nexus7K", pattern: r"(?i)\bN7K\b|Nexus\s*7[0-9]{3}" },
    FamilyRule { family: "ASA5500X", pattern: r"(?i)\bASA\s*55[0-9]{2}-X\b" },
    FamilyRule { family: "Firepower2100", pattern: r"(?i)\bFirepower\s*21[0-9]{2}\b|\bFPR21[0-9]{2}\b" },
    FamilyRule { family: "Firepower4100", pattern: r"(?i)\bFirepower\s*41[0-9]{2}\b|\bFPR41[0-9]{2}\b" },
];

struct CompiledRule {
    family: &'static str,
    regex: Regex,
}

fn compiled_rules() -> &'static Vec<CompiledRule> {
    static RULES_CELL: OnceLock<Vec<CompiledRule>> = OnceLock::new();
    RULES_CELL.get_or_init(|| {
        RULES
            .iter()
            .map(|r| CompiledRule { family: r.family, regex: Regex::new(r.pattern).expect("static pattern") })
            .collect()
    })
}

/// Returns the first matching hardware family, or `None` if nothing in the
/// table matches (caller treats `None` as "generic, applies to all").
pub fn classify(text: &str) -> Option<&'static str> {
    compiled_rules().iter().find(|r| r.regex.is_match(text)).map(|r| r.family)
}
