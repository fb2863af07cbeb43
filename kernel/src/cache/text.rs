// Search Text Projections
//
// Builds the token streams stored in the full-text index and used to build
// queries. Strict projections keep diacritics and whole words; loose
// projections fold diacritics away and add character trigrams so near
// spellings still meet. CJK runs have no word breaks and are indexed as
// overlapping bigrams.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

const HIVE_PREFIXES: &[&str] = &[
    "hkey_local_machine",
    "hkey_current_user",
    "hklm",
    "hkcu",
    "machine",
    "user",
];

/// Compatibility-normalized, lowercased text.
pub fn fold(text: &str) -> String {
    text.nfkc().collect::<String>().to_lowercase()
}

fn strip_marks(text: &str) -> String {
    text.nfd().filter(|c| !is_combining_mark(*c)).nfc().collect()
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30ff}'
        | '\u{3400}'..='\u{4dbf}'
        | '\u{4e00}'..='\u{9fff}'
        | '\u{ac00}'..='\u{d7af}'
        | '\u{f900}'..='\u{faff}'
    )
}

fn push_cjk_run(run: &[char], out: &mut Vec<String>) {
    match run.len() {
        0 => {}
        1 => out.push(run[0].to_string()),
        _ => out.extend(run.windows(2).map(|pair| pair.iter().collect())),
    }
}

/// Split folded text into words, breaking CJK runs into bigrams.
fn words(folded: &str) -> Vec<String> {
    let mut out = Vec::new();
    for chunk in folded.split(|c: char| !c.is_alphanumeric()) {
        let mut latin = String::new();
        let mut cjk = Vec::new();
        for c in chunk.chars() {
            if is_cjk(c) {
                if !latin.is_empty() {
                    out.push(std::mem::take(&mut latin));
                }
                cjk.push(c);
            } else {
                push_cjk_run(&cjk, &mut out);
                cjk.clear();
                latin.push(c);
            }
        }
        push_cjk_run(&cjk, &mut out);
        if !latin.is_empty() {
            out.push(latin);
        }
    }
    out
}

fn trigrams(word: &str) -> impl Iterator<Item = String> + '_ {
    let chars: Vec<char> = word.chars().collect();
    let count = if chars.len() > 3 && !chars.iter().any(|c| is_cjk(*c)) {
        chars.len() - 2
    } else {
        0
    };
    (0..count).map(move |i| chars[i..i + 3].iter().collect())
}

pub fn strict_tokens(text: &str) -> Vec<String> {
    words(&fold(text))
}

/// Diacritic-free words. Trigrams are not included.
pub fn loose_words(text: &str) -> Vec<String> {
    words(&strip_marks(&fold(text)))
}

pub fn loose_tokens(text: &str) -> Vec<String> {
    let base = loose_words(text);
    let mut out = base.clone();
    for word in &base {
        out.extend(trigrams(word));
    }
    out
}

pub fn strict_projection(text: &str) -> String {
    strict_tokens(text).join(" ")
}

pub fn loose_projection(text: &str) -> String {
    loose_tokens(text).join(" ")
}

/// Registry key without its hive prefix, lowercased, separators trimmed.
pub fn normalize_registry_path(path: &str) -> String {
    let lowered = path.trim().replace('/', "\\").to_ascii_lowercase();
    let mut rest = lowered.trim_matches('\\');
    for hive in HIVE_PREFIXES {
        if let Some(tail) = rest.strip_prefix(hive) {
            if tail.is_empty() || tail.starts_with('\\') || tail.starts_with(':') {
                rest = tail.trim_start_matches([':', '\\']);
                break;
            }
        }
    }
    rest.to_string()
}

pub fn registry_projection(key: &str, value: Option<&str>) -> String {
    let mut text = normalize_registry_path(key);
    if let Some(value) = value {
        text.push(' ');
        text.push_str(value);
    }
    strict_projection(&text)
}

/// Tag bag: namespace, value type, product hint and policy name.
pub fn tag_projection(
    namespace: &str,
    value_type: &str,
    product_hint: Option<&str>,
    policy_name: &str,
) -> String {
    let mut tags = vec![namespace.to_lowercase(), value_type.to_lowercase()];
    tags.extend(product_hint.map(str::to_lowercase));
    tags.push(policy_name.to_lowercase());
    strict_projection(&tags.join(" "))
}

/// Registry branch names that mark a query as a path even without a hive.
const REGISTRY_BRANCHES: [&str; 5] = [
    "software",
    "policies",
    "currentversion",
    "system",
    "wow6432node",
];

/// Whether a query reads like a registry path rather than prose.
pub fn looks_like_registry(query: &str) -> bool {
    let lowered = query.trim().to_ascii_lowercase();
    lowered.contains('\\')
        || lowered.starts_with("hkey_")
        || lowered.starts_with("hklm")
        || lowered.starts_with("hkcu")
        || lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .any(|word| REGISTRY_BRANCHES.contains(&word))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folding_normalizes_width_and_case() {
        assert_eq!(fold("ＰＯＬＩＣＹ Name"), "policy name");
    }

    #[test]
    fn loose_tokens_drop_diacritics_and_add_trigrams() {
        assert_eq!(strict_tokens("Café"), vec!["café"]);
        assert_eq!(loose_words("Café"), vec!["cafe"]);
        assert_eq!(loose_tokens("Audit"), vec!["audit", "aud", "udi", "dit"]);
        assert_eq!(loose_tokens("Tab"), vec!["tab"]);
    }

    #[test]
    fn cjk_runs_become_bigrams() {
        assert_eq!(strict_tokens("監査ポリシー"), vec!["監査", "査ポ", "ポリ", "リシ", "シー"]);
        assert_eq!(strict_tokens("Windows更新"), vec!["windows", "更新"]);
        assert_eq!(strict_tokens("字"), vec!["字"]);
    }

    #[test]
    fn registry_paths_lose_their_hive() {
        assert_eq!(
            normalize_registry_path(r"HKLM\Software\Policies\Contoso\"),
            r"software\policies\contoso"
        );
        assert_eq!(
            normalize_registry_path(r"HKEY_CURRENT_USER\Software\X"),
            r"software\x"
        );
        assert_eq!(normalize_registry_path(r"Software\X"), r"software\x");
        assert_eq!(normalize_registry_path(r"userland\X"), r"userland\x");
        assert!(looks_like_registry(r"Software\Policies"));
        assert!(looks_like_registry("HKLM"));
        assert!(!looks_like_registry("audit policy"));
    }

    #[test]
    fn branch_names_anywhere_mark_a_registry_query() {
        assert!(looks_like_registry("contoso policies"));
        assert!(looks_like_registry("Windows CurrentVersion run"));
        assert!(looks_like_registry("software/contoso"));
        assert!(!looks_like_registry("softwares inventory"));
        assert!(!looks_like_registry("screen saver timeout"));
    }

    #[test]
    fn registry_paths_fold_ascii_only() {
        assert_eq!(
            normalize_registry_path(r"Software\ÄRGER\Value"),
            "software\\Ärger\\value"
        );
    }
}
