// Ranked Policy Search
//
// Three candidate tiers, unioned per (policy, culture) keeping the best
// score:
//
//   K1  exact lookups: name or unique id 1200, registry path 1000,
//       name prefix 300
//   F1  strict full-text match, 100 - bm25, within [100, 299]
//   F2  loose full-text match,   60 - bm25, within [60, 99]
//
// Query text never reaches SQL directly: FTS expressions are assembled
// from quoted tokens and bound as parameters.

use std::collections::HashMap;

use bitflags::bitflags;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::store::CacheError;
use super::text;
use crate::model::{PolicyId, Presentation};

const EXACT_NAME_SCORE: f64 = 1200.0;
const EXACT_PATH_SCORE: f64 = 1000.0;
const PREFIX_SCORE: f64 = 300.0;
const STRICT_BASE: f64 = 100.0;
const STRICT_MAX: f64 = 299.0;
const LOOSE_BASE: f64 = 60.0;
const LOOSE_MAX: f64 = 99.0;

bitflags! {
    /// Fields a search may consult.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SearchFields: u8 {
        const NAME = 1 << 0;
        const DESCRIPTION = 1 << 1;
        const ID = 1 << 2;
        const REGISTRY = 1 << 3;
    }
}

impl Default for SearchFields {
    fn default() -> Self {
        SearchFields::NAME | SearchFields::DESCRIPTION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: PolicyId,
    pub culture: String,
    pub display_name: String,
    pub hive: String,
    pub registry_key: String,
    pub registry_value: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PolicyDetail {
    pub id: PolicyId,
    pub culture: String,
    pub display_name: String,
    pub explain_text: String,
    pub category_key: Option<String>,
    pub category_path: Vec<String>,
    pub hive: String,
    pub registry_key: String,
    pub registry_value: Option<String>,
    pub value_type: String,
    pub product_hint: Option<String>,
    pub presentation: Option<Presentation>,
}

const HIT_COLUMNS: &str = "p.id, p.ns, p.policy_name, p.hive, p.reg_key, p.reg_value, \
                           i.display_name, i.culture";

const DETAIL_COLUMNS: &str = "p.ns, p.policy_name, i.culture, i.display_name, i.explain_text, \
                              p.category_key, i.category_path, p.hive, p.reg_key, p.reg_value, \
                              p.value_type, p.product_hint, i.presentation_json";

fn hit_from_row(row: &Row<'_>, score: f64) -> rusqlite::Result<(i64, SearchHit)> {
    Ok((
        row.get(0)?,
        SearchHit {
            id: PolicyId::new(row.get::<_, String>(1)?, row.get::<_, String>(2)?),
            hive: row.get(3)?,
            registry_key: row.get(4)?,
            registry_value: row.get(5)?,
            display_name: row.get(6)?,
            culture: row.get(7)?,
            score,
        },
    ))
}

/// Escape one token as an FTS5 string, optionally as a prefix query.
fn quote(token: &str, prefix: bool) -> String {
    let mut quoted = String::with_capacity(token.len() + 3);
    quoted.push('"');
    quoted.push_str(&token.replace('"', "\"\""));
    quoted.push('"');
    if prefix {
        quoted.push('*');
    }
    quoted
}

/// FTS5 MATCH expression restricted to a column set.
#[derive(Debug, Default)]
pub(crate) struct MatchExpr {
    columns: Vec<&'static str>,
    terms: Vec<String>,
    joiner: &'static str,
}

impl MatchExpr {
    /// All tokens must match; the last one as a prefix.
    pub(crate) fn all(columns: Vec<&'static str>, tokens: &[String]) -> Self {
        let last = tokens.len().saturating_sub(1);
        Self {
            columns,
            terms: tokens
                .iter()
                .enumerate()
                .map(|(i, t)| quote(t, i == last))
                .collect(),
            joiner: " AND ",
        }
    }

    /// Any token may match. Whole words match as prefixes, grams exactly.
    pub(crate) fn any(columns: Vec<&'static str>, words: &[String], grams: &[String]) -> Self {
        Self {
            columns,
            terms: words
                .iter()
                .map(|w| quote(w, true))
                .chain(grams.iter().map(|g| quote(g, false)))
                .collect(),
            joiner: " OR ",
        }
    }

    pub(crate) fn build(&self) -> Option<String> {
        if self.columns.is_empty() || self.terms.is_empty() {
            return None;
        }
        Some(format!(
            "{{{}}} : ({})",
            self.columns.join(" "),
            self.terms.join(self.joiner)
        ))
    }
}

#[derive(Debug, Default)]
struct Candidates {
    best: HashMap<i64, SearchHit>,
}

impl Candidates {
    fn offer(&mut self, (policy_id, hit): (i64, SearchHit)) {
        match self.best.get_mut(&policy_id) {
            Some(existing) if existing.score >= hit.score => {}
            Some(existing) => *existing = hit,
            None => {
                self.best.insert(policy_id, hit);
            }
        }
    }

    fn ranked(self, limit: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self.best.into_values().collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.display_name.cmp(&b.display_name))
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        hits
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), CacheError> {
    if cancel.is_cancelled() {
        Err(CacheError::Cancelled)
    } else {
        Ok(())
    }
}

fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 1);
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn collect_exact(
    connection: &Connection,
    cancel: &CancellationToken,
    candidates: &mut Candidates,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
    score: f64,
) -> Result<(), CacheError> {
    let sql = format!(
        "SELECT {HIT_COLUMNS} FROM Policies p
         JOIN PolicyI18n i ON i.policy_id = p.id
         WHERE i.culture = ?1 AND ({filter})"
    );
    let mut stmt = connection.prepare(&sql)?;
    let rows = stmt.query_map(args, |row| hit_from_row(row, score))?;
    for row in rows {
        checkpoint(cancel)?;
        candidates.offer(row?);
    }
    Ok(())
}

fn collect_fts(
    connection: &Connection,
    cancel: &CancellationToken,
    candidates: &mut Candidates,
    expr: &str,
    culture: &str,
    limit: usize,
    base: f64,
    max: f64,
) -> Result<(), CacheError> {
    let sql = format!(
        "SELECT {HIT_COLUMNS}, bm25(PolicyIndex) AS relevance
         FROM PolicyIndex
         JOIN PolicyIndexMap m ON m.fts_rowid = PolicyIndex.rowid
         JOIN Policies p ON p.id = m.policy_id
         JOIN PolicyI18n i ON i.policy_id = p.id AND i.culture = m.culture
         WHERE PolicyIndex MATCH ?1 AND m.culture = ?2
         ORDER BY relevance
         LIMIT ?3"
    );
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);
    let mut stmt = connection.prepare(&sql)?;
    let rows = stmt.query_map(params![expr, culture, limit], |row| {
        let rank: f64 = row.get(8)?;
        hit_from_row(row, (base - rank).clamp(base, max))
    })?;
    for row in rows {
        checkpoint(cancel)?;
        candidates.offer(row?);
    }
    Ok(())
}

/// Ranked search within one culture. Stops with `Cancelled` between rows
/// once `cancel` fires.
pub(crate) fn search(
    connection: &Connection,
    query: &str,
    culture: &str,
    fields: SearchFields,
    limit: usize,
    cancel: &CancellationToken,
) -> Result<Vec<SearchHit>, CacheError> {
    let query = query.trim();
    if query.is_empty() || limit == 0 || fields.is_empty() {
        return Ok(Vec::new());
    }
    checkpoint(cancel)?;

    let mut fields = fields;
    if query.contains(':') {
        fields |= SearchFields::ID;
    }
    if text::looks_like_registry(query) {
        fields |= SearchFields::REGISTRY;
    }

    let mut candidates = Candidates::default();

    if fields.contains(SearchFields::NAME) {
        collect_exact(
            connection,
            cancel,
            &mut candidates,
            "p.policy_name = ?2 COLLATE NOCASE OR i.display_name = ?2 COLLATE NOCASE",
            params![culture, query],
            EXACT_NAME_SCORE,
        )?;
        let prefix = format!("{}%", escape_like(query));
        collect_exact(
            connection,
            cancel,
            &mut candidates,
            "p.policy_name LIKE ?2 ESCAPE '\\' OR i.display_name LIKE ?2 ESCAPE '\\'",
            params![culture, prefix],
            PREFIX_SCORE,
        )?;
    }
    if fields.contains(SearchFields::ID) {
        if let Some(id) = PolicyId::parse(query) {
            collect_exact(
                connection,
                cancel,
                &mut candidates,
                "p.ns = ?2 COLLATE NOCASE AND p.policy_name = ?3 COLLATE NOCASE",
                params![culture, id.namespace, id.name],
                EXACT_NAME_SCORE,
            )?;
        }
    }
    if fields.contains(SearchFields::REGISTRY) {
        let path = text::normalize_registry_path(query);
        if !path.is_empty() {
            collect_exact(
                connection,
                cancel,
                &mut candidates,
                "lower(trim(p.reg_key, '\\')) = ?2
                 OR lower(trim(p.reg_key, '\\') || '\\' || p.reg_value) = ?2",
                params![culture, path],
                EXACT_PATH_SCORE,
            )?;
        }
    }

    let fetch = limit.saturating_mul(4).max(50);

    let mut strict_columns = Vec::new();
    let mut loose_columns = Vec::new();
    if fields.contains(SearchFields::NAME) {
        strict_columns.push("title_norm");
        loose_columns.push("title_loose");
    }
    if fields.contains(SearchFields::DESCRIPTION) {
        strict_columns.push("desc_norm");
        loose_columns.push("desc_loose");
    }
    if fields.contains(SearchFields::REGISTRY) {
        strict_columns.push("registry_path");
    }
    if fields.contains(SearchFields::ID) {
        strict_columns.push("tags");
    }

    let strict = MatchExpr::all(strict_columns, &text::strict_tokens(query));
    if let Some(expr) = strict.build() {
        collect_fts(
            connection,
            cancel,
            &mut candidates,
            &expr,
            culture,
            fetch,
            STRICT_BASE,
            STRICT_MAX,
        )?;
    }

    let words = text::loose_words(query);
    let grams: Vec<String> = text::loose_tokens(query)
        .into_iter()
        .skip(words.len())
        .collect();
    let loose = MatchExpr::any(loose_columns, &words, &grams);
    if let Some(expr) = loose.build() {
        collect_fts(
            connection,
            cancel,
            &mut candidates,
            &expr,
            culture,
            fetch,
            LOOSE_BASE,
            LOOSE_MAX,
        )?;
    }

    Ok(candidates.ranked(limit))
}

fn detail_from_row(row: &Row<'_>) -> rusqlite::Result<(PolicyDetail, String, Option<String>)> {
    Ok((
        PolicyDetail {
            id: PolicyId::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?),
            culture: row.get(2)?,
            display_name: row.get(3)?,
            explain_text: row.get(4)?,
            category_key: row.get(5)?,
            category_path: Vec::new(),
            hive: row.get(7)?,
            registry_key: row.get(8)?,
            registry_value: row.get(9)?,
            value_type: row.get(10)?,
            product_hint: row.get(11)?,
            presentation: None,
        },
        row.get(6)?,
        row.get(12)?,
    ))
}

fn first_detail(
    connection: &Connection,
    cancel: &CancellationToken,
    filter: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Option<PolicyDetail>, CacheError> {
    checkpoint(cancel)?;
    let sql = format!(
        "SELECT {DETAIL_COLUMNS} FROM Policies p
         JOIN PolicyI18n i ON i.policy_id = p.id
         WHERE i.culture = ?1 AND ({filter})
         ORDER BY p.ns, p.policy_name
         LIMIT 1"
    );
    let Some((mut detail, category_path, presentation)) = connection
        .query_row(&sql, args, detail_from_row)
        .optional()?
    else {
        return Ok(None);
    };
    detail.category_path = serde_json::from_str(&category_path)?;
    detail.presentation = presentation
        .map(|json| serde_json::from_str(&json))
        .transpose()?;
    Ok(Some(detail))
}

/// Detail by `ns:name` unique id or bare policy name.
pub(crate) fn detail_by_name(
    connection: &Connection,
    name: &str,
    culture: &str,
    cancel: &CancellationToken,
) -> Result<Option<PolicyDetail>, CacheError> {
    match PolicyId::parse(name) {
        Some(id) => first_detail(
            connection,
            cancel,
            "p.ns = ?2 COLLATE NOCASE AND p.policy_name = ?3 COLLATE NOCASE",
            params![culture, id.namespace, id.name],
        ),
        None => first_detail(
            connection,
            cancel,
            "p.policy_name = ?2 COLLATE NOCASE",
            params![culture, name.trim()],
        ),
    }
}

/// Detail of the first policy writing under `path` (hive prefix optional,
/// optionally ending in the value name).
pub(crate) fn detail_by_registry_path(
    connection: &Connection,
    path: &str,
    culture: &str,
    cancel: &CancellationToken,
) -> Result<Option<PolicyDetail>, CacheError> {
    let path = text::normalize_registry_path(path);
    if path.is_empty() {
        return Ok(None);
    }
    first_detail(
        connection,
        cancel,
        "lower(trim(p.reg_key, '\\') || '\\' || p.reg_value) = ?2
         OR lower(trim(p.reg_key, '\\')) = ?2",
        params![culture, path],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_expressions_quote_every_token() {
        let tokens = vec!["audit".to_string(), "po\"l".to_string()];
        let expr = MatchExpr::all(vec!["title_norm", "desc_norm"], &tokens);
        assert_eq!(
            expr.build().as_deref(),
            Some(r#"{title_norm desc_norm} : ("audit" AND "po""l"*)"#)
        );

        let expr = MatchExpr::any(vec!["title_loose"], &["cafe".into()], &["caf".into()]);
        assert_eq!(
            expr.build().as_deref(),
            Some(r#"{title_loose} : ("cafe"* OR "caf")"#)
        );

        assert_eq!(MatchExpr::all(vec![], &tokens).build(), None);
        assert_eq!(MatchExpr::all(vec!["tags"], &[]).build(), None);
    }

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like(r"50%_a\b"), r"50\%\_a\\b");
    }

    #[test]
    fn candidates_keep_the_best_score_per_policy() {
        let hit = |name: &str, score: f64| SearchHit {
            id: PolicyId::new("ns", name),
            culture: "en-US".into(),
            display_name: name.into(),
            hive: "HKLM".into(),
            registry_key: "K".into(),
            registry_value: None,
            score,
        };
        let mut candidates = Candidates::default();
        candidates.offer((1, hit("b", 150.0)));
        candidates.offer((1, hit("b", 1200.0)));
        candidates.offer((1, hit("b", 70.0)));
        candidates.offer((2, hit("a", 150.0)));
        candidates.offer((3, hit("c", 150.0)));

        let ranked = candidates.ranked(2);
        let names: Vec<_> = ranked.iter().map(|h| h.id.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(ranked[0].score, 1200.0);
    }
}
