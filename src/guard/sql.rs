//! Read-only SQL gate
//!
//! Keyword/shape inspection of submitted statements, not a parser. The
//! disallowed keywords are matched as plain substrings of the
//! upper-cased statement, so an identifier such as `update_date` or a string
//! literal containing `DROP` is rejected as well. A keyword split across a
//! comment or built dynamically inside the database is not caught here; the
//! execution engine additionally runs every statement in a READ ONLY
//! transaction.
//!
//! Statement boundaries and table references come from a token scan that
//! skips string literals, quoted identifiers and comments, so `'a;b'` is one
//! statement. A FROM list the scan cannot follow (table functions, dangling
//! commas, unbalanced parentheses) rejects the statement.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

/// Keywords that may never appear in a governed query
pub const DISALLOWED_KEYWORDS: [&str; 9] = [
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
];

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?s)(?P<space>\s+)|(?P<comment>--[^\n]*|/\*.*?(?:\*/|$))|(?P<literal>'(?:[^']|'')*'?)|(?P<quoted>"(?:[^"]|"")*"?)|(?P<word>[A-Za-z_][A-Za-z0-9_$]*)|(?P<punct>[(),.;])|(?P<other>.)"#,
    )
    .expect("token pattern is valid")
});

/// Words that end a FROM item instead of aliasing it
const CLAUSE_WORDS: [&str; 24] = [
    "WHERE", "GROUP", "ORDER", "HAVING", "LIMIT", "OFFSET", "ON", "USING", "UNION", "INTERSECT",
    "EXCEPT", "WINDOW", "FETCH", "FOR", "JOIN", "INNER", "LEFT", "RIGHT", "FULL", "OUTER",
    "CROSS", "NATURAL", "FROM", "SELECT",
];

/// Why a statement was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "keyword", rename_all = "snake_case")]
pub enum ViolationReason {
    EmptyStatement,
    NotASelect,
    MultipleStatements,
    UnreadableFromClause,
    DisallowedKeyword(String),
}

impl ViolationReason {
    /// Stable reason code
    pub fn code(&self) -> String {
        match self {
            ViolationReason::EmptyStatement => "empty_statement".to_string(),
            ViolationReason::NotASelect => "not_a_select".to_string(),
            ViolationReason::MultipleStatements => "multiple_statements".to_string(),
            ViolationReason::UnreadableFromClause => "unreadable_from_clause".to_string(),
            ViolationReason::DisallowedKeyword(k) => format!("disallowed_keyword:{}", k),
        }
    }
}

/// SQL validation failure: the offending reason plus the original text
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("SQL rejected ({}): {}", .reason.code(), .sql)]
pub struct SqlViolation {
    pub reason: ViolationReason,
    pub sql: String,
}

impl SqlViolation {
    /// The keyword that triggered the rejection, if any
    pub fn keyword(&self) -> Option<&str> {
        match &self.reason {
            ViolationReason::DisallowedKeyword(k) => Some(k.as_str()),
            _ => None,
        }
    }

    /// Human readable message for API payloads
    pub fn message(&self) -> String {
        match &self.reason {
            ViolationReason::EmptyStatement => "Query text is empty".to_string(),
            ViolationReason::NotASelect => "Only SELECT queries are allowed".to_string(),
            ViolationReason::MultipleStatements => {
                "Only a single statement may be submitted".to_string()
            }
            ViolationReason::UnreadableFromClause => {
                "Could not determine which tables the query reads".to_string()
            }
            ViolationReason::DisallowedKeyword(k) => format!("Keyword '{}' is not allowed", k),
        }
    }
}

/// A statement that passed the gate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSql {
    pub sql: String,
    /// Tables referenced after FROM / JOIN, lower-cased, in first-seen order
    pub tables: Vec<String>,
}

/// Check that `sql` is a single bare read.
pub fn validate_sql(sql: &str) -> Result<ValidatedSql, SqlViolation> {
    let normalized = sql.trim().to_uppercase();
    let reject = |reason| SqlViolation {
        reason,
        sql: sql.to_string(),
    };

    if normalized.is_empty() {
        return Err(reject(ViolationReason::EmptyStatement));
    }

    if !normalized.starts_with("SELECT") {
        return Err(reject(ViolationReason::NotASelect));
    }

    if let Some(keyword) = DISALLOWED_KEYWORDS
        .iter()
        .find(|keyword| normalized.contains(*keyword))
    {
        return Err(reject(ViolationReason::DisallowedKeyword(keyword.to_string())));
    }

    let spanned = tokenize(sql);

    // A trailing semicolon is fine, anything after it is a second statement
    let mut body = sql;
    if let Some(pos) = spanned.iter().position(|(_, t)| *t == Token::Semicolon) {
        if pos + 1 < spanned.len() {
            return Err(reject(ViolationReason::MultipleStatements));
        }
        body = &sql[..spanned[pos].0];
    }

    let tokens: Vec<Token> = spanned.into_iter().map(|(_, t)| t).collect();
    let tables = scan_tables(&tokens).ok_or_else(|| reject(ViolationReason::UnreadableFromClause))?;

    Ok(ValidatedSql {
        sql: body.trim().to_string(),
        tables,
    })
}

/// Tables named in FROM lists and JOINs, schema-qualified names kept as written.
/// `None` when the FROM clauses cannot be followed.
pub fn referenced_tables(sql: &str) -> Option<Vec<String>> {
    let tokens: Vec<Token> = tokenize(sql).into_iter().map(|(_, t)| t).collect();
    scan_tables(&tokens)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    /// Bare word, upper-cased
    Word(String),
    /// Double-quoted identifier, quotes removed
    Quoted(String),
    Open,
    Close,
    Comma,
    Dot,
    Semicolon,
    Other,
}

impl Token {
    fn is_word(&self, word: &str) -> bool {
        matches!(self, Token::Word(w) if w == word)
    }

    /// Identifier text as it names a table
    fn name(&self) -> Option<String> {
        match self {
            Token::Word(w) => Some(w.to_lowercase()),
            Token::Quoted(q) => Some(q.replace("\"\"", "\"").to_lowercase()),
            _ => None,
        }
    }

    fn is_alias(&self) -> bool {
        match self {
            Token::Word(w) => !CLAUSE_WORDS.contains(&w.as_str()),
            Token::Quoted(_) => true,
            _ => false,
        }
    }
}

/// Tokens with their byte offsets. Whitespace and comments are dropped.
fn tokenize(sql: &str) -> Vec<(usize, Token)> {
    TOKEN
        .captures_iter(sql)
        .filter_map(|cap| {
            let whole = cap.get(0)?;
            let token = if let Some(word) = cap.name("word") {
                Token::Word(word.as_str().to_uppercase())
            } else if let Some(quoted) = cap.name("quoted") {
                Token::Quoted(quoted.as_str().trim_matches('"').to_string())
            } else if let Some(punct) = cap.name("punct") {
                match punct.as_str() {
                    "(" => Token::Open,
                    ")" => Token::Close,
                    "," => Token::Comma,
                    "." => Token::Dot,
                    _ => Token::Semicolon,
                }
            } else if cap.name("literal").is_some() || cap.name("other").is_some() {
                Token::Other
            } else {
                return None;
            };
            Some((whole.start(), token))
        })
        .collect()
}

/// Where a query scope is inside its FROM clause
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FromState {
    Outside,
    ExpectTable,
    AfterTable,
    ExpectAlias,
    AfterAlias,
}

/// One level of parentheses. Only scopes that open with SELECT or WITH have
/// FROM clauses; the rest are expressions such as `EXTRACT(YEAR FROM ts)`.
struct Scope {
    query: bool,
    fresh: bool,
    state: FromState,
}

impl Scope {
    fn statement() -> Self {
        Self {
            query: true,
            fresh: false,
            state: FromState::Outside,
        }
    }

    fn nested() -> Self {
        Self {
            query: false,
            fresh: true,
            state: FromState::Outside,
        }
    }

    /// Stopped in the middle of a FROM item
    fn is_incomplete(&self) -> bool {
        matches!(self.state, FromState::ExpectTable | FromState::ExpectAlias)
    }
}

fn scan_tables(tokens: &[Token]) -> Option<Vec<String>> {
    let mut tables: Vec<String> = Vec::new();
    let mut scopes = vec![Scope::statement()];
    let mut previous: Option<&Token> = None;
    let mut i = 0;

    while i < tokens.len() {
        let token = &tokens[i];
        i += 1;

        let scope = scopes.last_mut()?;
        if scope.fresh {
            scope.fresh = false;
            scope.query = token.is_word("SELECT") || token.is_word("WITH");
        }

        match token {
            Token::Open => {
                if scope.query && scope.state == FromState::ExpectTable {
                    // Derived table: its own scope lists its tables, an alias follows
                    scope.state = FromState::AfterTable;
                }
                scopes.push(Scope::nested());
            }
            Token::Close => {
                let closed = scopes.pop()?;
                if closed.query && closed.is_incomplete() {
                    return None;
                }
                if scopes.is_empty() {
                    return None;
                }
            }
            _ if !scope.query => {}
            _ => match scope.state {
                FromState::ExpectTable => {
                    if token.is_word("ONLY") || token.is_word("LATERAL") {
                        previous = Some(token);
                        continue;
                    }
                    if !token.is_alias() {
                        return None;
                    }
                    let mut name = token.name()?;
                    while tokens.get(i) == Some(&Token::Dot) {
                        name.push('.');
                        name.push_str(&tokens.get(i + 1)?.name()?);
                        i += 2;
                    }
                    if tokens.get(i) == Some(&Token::Open) {
                        // Table function
                        return None;
                    }
                    if !tables.contains(&name) {
                        tables.push(name);
                    }
                    scope.state = FromState::AfterTable;
                }
                FromState::AfterTable | FromState::AfterAlias => {
                    scope.state = match token {
                        Token::Comma => FromState::ExpectTable,
                        t if t.is_word("JOIN") => FromState::ExpectTable,
                        t if t.is_word("AS") && scope.state == FromState::AfterTable => {
                            FromState::ExpectAlias
                        }
                        t if t.is_alias() && scope.state == FromState::AfterTable => {
                            FromState::AfterAlias
                        }
                        _ => FromState::Outside,
                    };
                }
                FromState::ExpectAlias => {
                    if !token.is_alias() {
                        return None;
                    }
                    scope.state = FromState::AfterAlias;
                }
                FromState::Outside => {
                    let distinct = previous.is_some_and(|p| p.is_word("DISTINCT"));
                    if (token.is_word("FROM") && !distinct) || token.is_word("JOIN") {
                        scope.state = FromState::ExpectTable;
                    }
                }
            },
        }
        previous = Some(token);
    }

    match scopes.as_slice() {
        [top] if !top.is_incomplete() => Some(tables),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_accepts_plain_select() {
        let validated = validate_sql("  select * from loans where amount > 10 ").unwrap();
        assert_eq!(validated.sql, "select * from loans where amount > 10");
        assert_eq!(validated.tables, vec!["loans".to_string()]);
    }

    #[test]
    fn test_rejects_non_select_statements() {
        for sql in [
            "DROP TABLE customers",
            "with x as (select 1) select * from x",
            "EXPLAIN SELECT 1",
            "insert into t values (1)",
        ] {
            let err = validate_sql(sql).unwrap_err();
            assert_eq!(err.reason, ViolationReason::NotASelect, "{}", sql);
            assert_eq!(err.sql, sql);
            assert_eq!(err.reason.code(), "not_a_select");
        }
    }

    #[test]
    fn test_rejects_every_disallowed_keyword_case_insensitively() {
        for keyword in DISALLOWED_KEYWORDS {
            let sql = format!("SELECT * FROM loans; {} something", keyword.to_lowercase());
            let err = validate_sql(&sql).unwrap_err();
            assert_eq!(err.keyword(), Some(keyword));
            assert_eq!(err.message(), format!("Keyword '{}' is not allowed", keyword));
        }
    }

    #[test]
    fn test_identifier_containing_keyword_is_rejected() {
        let err = validate_sql("SELECT update_date FROM loans").unwrap_err();
        assert_eq!(err.keyword(), Some("UPDATE"));
    }

    #[test]
    fn test_rejects_stacked_statements() {
        let err = validate_sql("SELECT 1; SELECT 2").unwrap_err();
        assert_eq!(err.reason, ViolationReason::MultipleStatements);
        assert_eq!(validate_sql("SELECT 1;").unwrap().sql, "SELECT 1");
        assert_eq!(validate_sql("SELECT 1 ; -- done").unwrap().sql, "SELECT 1");
    }

    #[test]
    fn test_semicolon_inside_literal_is_one_statement() {
        let validated = validate_sql("SELECT 'a;b' AS note FROM loans").unwrap();
        assert_eq!(validated.tables, vec!["loans".to_string()]);
        assert!(validate_sql(r#"SELECT "odd;name" FROM loans;"#).is_ok());
    }

    #[test]
    fn test_rejects_empty_statement() {
        let err = validate_sql("   ").unwrap_err();
        assert_eq!(err.reason, ViolationReason::EmptyStatement);
    }

    fn tables(sql: &str) -> Vec<String> {
        validate_sql(sql).unwrap().tables
    }

    #[test]
    fn test_extracts_table_dependencies() {
        let found = referenced_tables(
            r#"SELECT c.id FROM core."Customers" c JOIN loans l ON l.cid = c.id left join LOANS x on true"#,
        );
        assert_eq!(
            found,
            Some(vec!["core.customers".to_string(), "loans".to_string()])
        );
    }

    #[test]
    fn test_comma_joined_tables_are_all_listed() {
        assert_eq!(tables("SELECT * FROM loans, customers"), vec!["loans", "customers"]);
        assert_eq!(
            tables("SELECT l.id FROM loans l, customers AS c, core.accounts WHERE l.cid = c.id"),
            vec!["loans", "customers", "core.accounts"]
        );
        assert_eq!(
            tables("SELECT * FROM (SELECT id FROM loans) q, customers c"),
            vec!["loans", "customers"]
        );
        assert_eq!(
            tables("SELECT * FROM loans WHERE cid IN (SELECT id FROM customers, accounts)"),
            vec!["loans", "customers", "accounts"]
        );
    }

    #[test]
    fn test_from_inside_expressions_is_not_a_table() {
        assert_eq!(
            tables("SELECT EXTRACT(YEAR FROM originated_at) FROM loans"),
            vec!["loans"]
        );
        assert_eq!(
            tables("SELECT TRIM(BOTH ' ' FROM name), SUBSTRING(code FROM 1 FOR 3) FROM loans"),
            vec!["loans"]
        );
        assert_eq!(
            tables("SELECT * FROM loans l JOIN payments p ON l.id IS DISTINCT FROM p.loan_id"),
            vec!["loans", "payments"]
        );
        assert_eq!(tables("SELECT 1 -- FROM customers"), Vec::<String>::new());
    }

    #[test]
    fn test_unreadable_from_clause_is_rejected() {
        for sql in [
            "SELECT * FROM loans,",
            "SELECT * FROM generate_series(1, 10) g",
            "SELECT * FROM",
            "SELECT * FROM (SELECT 1",
            "SELECT * FROM loans AS",
        ] {
            let err = validate_sql(sql).unwrap_err();
            assert_eq!(err.reason, ViolationReason::UnreadableFromClause, "{}", sql);
            assert_eq!(err.reason.code(), "unreadable_from_clause");
        }
    }
}
