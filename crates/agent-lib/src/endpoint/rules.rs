//! Discovery rule expressions
//!
//! Rules are boolean expressions over an endpoint's variable map, e.g.
//! `port == 8080 && portType == "TCP"` or
//! `container_image =~ "redis" && Get(container_labels, "env") != "dev"`.
//!
//! Supported syntax:
//! - literals: strings (single or double quoted), numbers, `true`, `false`, `nil`
//! - variables, with dotted lookup into maps (`container.labels.app`)
//! - `==`, `!=`, `<`, `<=`, `>`, `>=`, `=~`, `!~`, `&&`, `||`, `!`, parentheses
//! - functions `Get(map, key)` and `Contains(map_or_list, key)`
//!
//! Expressions are parsed once when the config is loaded. Evaluation walks a
//! finite tree and performs no I/O.

use crate::error::ConfigError;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Value of a rule variable or intermediate result
#[derive(Debug, Clone, PartialEq)]
pub enum RuleValue {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    List(Vec<RuleValue>),
    Map(BTreeMap<String, RuleValue>),
}

impl RuleValue {
    fn type_name(&self) -> &'static str {
        match self {
            RuleValue::Null => "nil",
            RuleValue::Bool(_) => "bool",
            RuleValue::Num(_) => "number",
            RuleValue::Str(_) => "string",
            RuleValue::List(_) => "list",
            RuleValue::Map(_) => "map",
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            RuleValue::Num(n) => Some(*n),
            RuleValue::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn as_text(&self) -> Option<String> {
        match self {
            RuleValue::Str(s) => Some(s.clone()),
            RuleValue::Num(n) => Some(format_number(*n)),
            RuleValue::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn loose_eq(&self, other: &RuleValue) -> bool {
        match (self, other) {
            (RuleValue::Num(a), b) | (b, RuleValue::Num(a)) => {
                b.as_number().map(|b| b == *a).unwrap_or(false)
            }
            (a, b) => a == b,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl fmt::Display for RuleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleValue::Null => write!(f, "nil"),
            RuleValue::Bool(b) => write!(f, "{}", b),
            RuleValue::Num(n) => write!(f, "{}", format_number(*n)),
            RuleValue::Str(s) => write!(f, "{:?}", s),
            RuleValue::List(items) => write!(f, "[{} items]", items.len()),
            RuleValue::Map(m) => write!(f, "{{{} keys}}", m.len()),
        }
    }
}

/// Runtime failure while evaluating a rule
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("variable '{0}' is not defined for this endpoint")]
    MissingVariable(String),
    #[error("operator {op} cannot be applied to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("invalid regular expression '{0}'")]
    BadRegex(String),
    #[error("{0}")]
    BadCall(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    True,
    False,
    Nil,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Match,
    NotMatch,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Comma,
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '=' if next == Some('~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' if next == Some('~') => {
                tokens.push(Token::NotMatch);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if next == Some('=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if next == Some('=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                s.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lexeme: String = chars[start..i].iter().collect();
                let n = lexeme
                    .parse()
                    .map_err(|_| format!("invalid number '{}'", lexeme))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "nil" | "null" => Token::Nil,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::Ne => "!=",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Func {
    Get,
    Contains,
}

#[derive(Debug, Clone)]
enum Expr {
    Literal(RuleValue),
    Var(Vec<String>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
    Match {
        subject: Box<Expr>,
        pattern: Box<Expr>,
        compiled: Option<Regex>,
        negated: bool,
    },
    Call(Func, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.advance() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of rule", want)),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_comparison()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Some(CompareOp::Eq),
            Some(Token::Ne) => Some(CompareOp::Ne),
            Some(Token::Lt) => Some(CompareOp::Lt),
            Some(Token::Le) => Some(CompareOp::Le),
            Some(Token::Gt) => Some(CompareOp::Gt),
            Some(Token::Ge) => Some(CompareOp::Ge),
            Some(Token::Match) | Some(Token::NotMatch) => {
                let negated = self.advance() == Some(Token::NotMatch);
                let pattern = self.parse_unary()?;
                let compiled = match &pattern {
                    Expr::Literal(RuleValue::Str(p)) => Some(
                        Regex::new(p).map_err(|e| format!("invalid regex '{}': {}", p, e))?,
                    ),
                    _ => None,
                };
                return Ok(Expr::Match {
                    subject: Box::new(left),
                    pattern: Box::new(pattern),
                    compiled,
                    negated,
                });
            }
            _ => None,
        };

        match op {
            Some(op) => {
                self.advance();
                let right = self.parse_unary()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(RuleValue::Str(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(RuleValue::Num(n))),
            Some(Token::True) => Ok(Expr::Literal(RuleValue::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(RuleValue::Bool(false))),
            Some(Token::Nil) => Ok(Expr::Literal(RuleValue::Null)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.advance();
                    let func = match name.as_str() {
                        "Get" => Func::Get,
                        "Contains" => Func::Contains,
                        other => return Err(format!("unknown function '{}'", other)),
                    };
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.advance();
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    if args.len() != 2 {
                        return Err(format!("{} takes 2 arguments", name));
                    }
                    Ok(Expr::Call(func, args))
                } else {
                    Ok(Expr::Var(name.split('.').map(str::to_string).collect()))
                }
            }
            Some(t) => Err(format!("unexpected token {:?}", t)),
            None => Err("unexpected end of rule".to_string()),
        }
    }
}

/// A parsed discovery rule
#[derive(Debug, Clone)]
pub struct Rule {
    text: String,
    expr: Expr,
    vars: Vec<String>,
}

impl Rule {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let invalid =
            |reason: String| ConfigError::validation(format!("invalid discovery rule '{}': {}", text, reason));

        let tokens = tokenize(text).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("rule is empty".to_string()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or().map_err(invalid)?;
        if let Some(t) = parser.peek() {
            return Err(invalid(format!("unexpected trailing token {:?}", t)));
        }

        let mut vars = Vec::new();
        collect_vars(&expr, &mut vars);
        vars.sort();
        vars.dedup();

        Ok(Self {
            text: text.to_string(),
            expr,
            vars,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Root variable names referenced by the rule
    pub fn variables(&self) -> &[String] {
        &self.vars
    }

    pub fn evaluate(&self, vars: &HashMap<String, RuleValue>) -> Result<RuleValue, RuleError> {
        if let Some(missing) = self.vars.iter().find(|v| !vars.contains_key(*v)) {
            return Err(RuleError::MissingVariable(missing.clone()));
        }
        eval(&self.expr, vars)
    }

    /// True only when the rule evaluates to boolean `true`. Missing variables,
    /// evaluation errors, and non-boolean results are all non-matches.
    pub fn matches(&self, vars: &HashMap<String, RuleValue>) -> bool {
        match self.evaluate(vars) {
            Ok(RuleValue::Bool(b)) => b,
            Ok(other) => {
                debug!(rule = %self.text, result = %other, "Discovery rule did not evaluate to a boolean");
                false
            }
            Err(e) => {
                debug!(rule = %self.text, error = %e, "Discovery rule does not match endpoint");
                false
            }
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn collect_vars(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Literal(_) => {}
        Expr::Var(path) => {
            if let Some(root) = path.first() {
                out.push(root.clone());
            }
        }
        Expr::Not(e) => collect_vars(e, out),
        Expr::And(l, r) | Expr::Or(l, r) | Expr::Compare(_, l, r) => {
            collect_vars(l, out);
            collect_vars(r, out);
        }
        Expr::Match {
            subject, pattern, ..
        } => {
            collect_vars(subject, out);
            collect_vars(pattern, out);
        }
        Expr::Call(_, args) => args.iter().for_each(|a| collect_vars(a, out)),
    }
}

fn lookup(path: &[String], vars: &HashMap<String, RuleValue>) -> Result<RuleValue, RuleError> {
    let (root, rest) = match path.split_first() {
        Some(parts) => parts,
        None => return Ok(RuleValue::Null),
    };
    let mut current = vars
        .get(root)
        .ok_or_else(|| RuleError::MissingVariable(root.clone()))?;

    for segment in rest {
        match current {
            RuleValue::Map(m) => match m.get(segment) {
                Some(v) => current = v,
                None => return Ok(RuleValue::Null),
            },
            _ => return Ok(RuleValue::Null),
        }
    }
    Ok(current.clone())
}

/// `portType` is written both as `"TCP"` and `"tcp"` in rules
fn is_port_type(expr: &Expr) -> bool {
    matches!(expr, Expr::Var(path) if path.len() == 1 && (path[0] == "portType" || path[0] == "port_type"))
}

fn expect_bool(v: RuleValue, op: &'static str) -> Result<bool, RuleError> {
    match v {
        RuleValue::Bool(b) => Ok(b),
        other => Err(RuleError::TypeMismatch {
            op,
            left: other.type_name(),
            right: "bool",
        }),
    }
}

fn eval(expr: &Expr, vars: &HashMap<String, RuleValue>) -> Result<RuleValue, RuleError> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Var(path) => lookup(path, vars),
        Expr::Not(inner) => Ok(RuleValue::Bool(!expect_bool(eval(inner, vars)?, "!")?)),
        Expr::And(l, r) => {
            if !expect_bool(eval(l, vars)?, "&&")? {
                return Ok(RuleValue::Bool(false));
            }
            Ok(RuleValue::Bool(expect_bool(eval(r, vars)?, "&&")?))
        }
        Expr::Or(l, r) => {
            if expect_bool(eval(l, vars)?, "||")? {
                return Ok(RuleValue::Bool(true));
            }
            Ok(RuleValue::Bool(expect_bool(eval(r, vars)?, "||")?))
        }
        Expr::Compare(op, l, r) => {
            let left = eval(l, vars)?;
            let right = eval(r, vars)?;
            if is_port_type(l) || is_port_type(r) {
                if let (RuleValue::Str(a), RuleValue::Str(b), CompareOp::Eq | CompareOp::Ne) =
                    (&left, &right, op)
                {
                    return Ok(RuleValue::Bool(a.eq_ignore_ascii_case(b) == (*op == CompareOp::Eq)));
                }
            }
            compare(*op, &left, &right).map(RuleValue::Bool)
        }
        Expr::Match {
            subject,
            pattern,
            compiled,
            negated,
        } => {
            let subject = eval(subject, vars)?;
            let text = match subject.as_text() {
                Some(t) => t,
                None => return Ok(RuleValue::Bool(*negated)),
            };
            let matched = match compiled {
                Some(re) => re.is_match(&text),
                None => {
                    let p = eval(pattern, vars)?
                        .as_text()
                        .ok_or_else(|| RuleError::BadRegex("non-string pattern".to_string()))?;
                    Regex::new(&p)
                        .map_err(|_| RuleError::BadRegex(p.clone()))?
                        .is_match(&text)
                }
            };
            Ok(RuleValue::Bool(matched != *negated))
        }
        Expr::Call(func, args) => {
            let target = eval(&args[0], vars)?;
            let key = eval(&args[1], vars)?
                .as_text()
                .ok_or_else(|| RuleError::BadCall("key must be a string".to_string()))?;
            match (func, target) {
                (Func::Get, RuleValue::Map(m)) => Ok(m.get(&key).cloned().unwrap_or(RuleValue::Null)),
                (Func::Get, RuleValue::Null) => Ok(RuleValue::Null),
                (Func::Contains, RuleValue::Map(m)) => Ok(RuleValue::Bool(m.contains_key(&key))),
                (Func::Contains, RuleValue::List(items)) => Ok(RuleValue::Bool(
                    items.iter().any(|i| i.as_text().as_deref() == Some(key.as_str())),
                )),
                (Func::Contains, RuleValue::Null) => Ok(RuleValue::Bool(false)),
                (f, other) => Err(RuleError::BadCall(format!(
                    "{:?} cannot be applied to {}",
                    f,
                    other.type_name()
                ))),
            }
        }
    }
}

fn compare(op: CompareOp, left: &RuleValue, right: &RuleValue) -> Result<bool, RuleError> {
    match op {
        CompareOp::Eq => Ok(left.loose_eq(right)),
        CompareOp::Ne => Ok(!left.loose_eq(right)),
        _ => {
            let (a, b) = match (left.as_number(), right.as_number()) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(RuleError::TypeMismatch {
                        op: op.symbol(),
                        left: left.type_name(),
                        right: right.type_name(),
                    })
                }
            };
            Ok(match op {
                CompareOp::Lt => a < b,
                CompareOp::Le => a <= b,
                CompareOp::Gt => a > b,
                CompareOp::Ge => a >= b,
                CompareOp::Eq | CompareOp::Ne => unreachable!("handled above"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> HashMap<String, RuleValue> {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), RuleValue::Str("redis".to_string()));

        let mut container = BTreeMap::new();
        container.insert("image".to_string(), RuleValue::Str("redis:7".to_string()));
        container.insert("labels".to_string(), RuleValue::Map(labels.clone()));

        let mut v = HashMap::new();
        v.insert("port".to_string(), RuleValue::Num(6379.0));
        v.insert("portType".to_string(), RuleValue::Str("TCP".to_string()));
        v.insert("container_image".to_string(), RuleValue::Str("redis:7".to_string()));
        v.insert("labels".to_string(), RuleValue::Map(labels));
        v.insert("container".to_string(), RuleValue::Map(container));
        v.insert("network_port".to_string(), RuleValue::Str("6379".to_string()));
        v
    }

    fn check(rule: &str) -> bool {
        Rule::parse(rule).unwrap().matches(&vars())
    }

    #[test]
    fn test_equality_and_logic() {
        assert!(check(r#"port == 6379 && portType == "TCP""#));
        assert!(!check(r#"port == 8080 && portType == "TCP""#));
        assert!(check(r#"port == 8080 || portType == 'TCP'"#));
        assert!(check(r#"!(port == 8080)"#));
        assert!(check(r#"port != 8080"#));
    }

    #[test]
    fn test_port_type_ignores_case() {
        assert!(check(r#"portType == "tcp""#));
        assert!(check(r#""Tcp" == portType"#));
        assert!(!check(r#"portType != "tcp""#));
        assert!(!check(r#"portType == "udp""#));
        // Other string comparisons stay exact
        assert!(!check(r#"container_image == "REDIS:7""#));
    }

    #[test]
    fn test_numeric_coercion_and_ordering() {
        assert!(check("network_port == 6379"));
        assert!(check("port >= 1024 && port < 65536"));
        assert!(!check("port > 7000"));
    }

    #[test]
    fn test_regex_match() {
        assert!(check(r#"container_image =~ "^redis""#));
        assert!(!check(r#"container_image =~ "^nginx""#));
        assert!(check(r#"container_image !~ "nginx""#));
    }

    #[test]
    fn test_dotted_path_and_functions() {
        assert!(check(r#"container.labels.app == "redis""#));
        assert!(check(r#"container.labels.missing == nil"#));
        assert!(check(r#"Get(labels, "app") == "redis""#));
        assert!(check(r#"Contains(labels, "app")"#));
        assert!(!check(r#"Contains(labels, "env")"#));
    }

    #[test]
    fn test_missing_variable_does_not_match() {
        let rule = Rule::parse(r#"kubernetes_namespace == "default""#).unwrap();
        assert!(matches!(
            rule.evaluate(&vars()),
            Err(RuleError::MissingVariable(_))
        ));
        assert!(!rule.matches(&vars()));
    }

    #[test]
    fn test_non_boolean_result_does_not_match() {
        let rule = Rule::parse("port").unwrap();
        assert_eq!(rule.evaluate(&vars()).unwrap(), RuleValue::Num(6379.0));
        assert!(!rule.matches(&vars()));
    }

    #[test]
    fn test_parse_errors() {
        assert!(Rule::parse("").is_err());
        assert!(Rule::parse("port ==").is_err());
        assert!(Rule::parse("(port == 1").is_err());
        assert!(Rule::parse(r#"image =~ "(unclosed""#).is_err());
        assert!(Rule::parse(r#"Unknown(labels, "a")"#).is_err());
        assert!(Rule::parse(r#"Get(labels)"#).is_err());
        assert!(Rule::parse("port == 1 port").is_err());
    }

    #[test]
    fn test_variables_collected() {
        let rule = Rule::parse(r#"port == 1 && Get(container.labels, "a") == "b""#).unwrap();
        assert_eq!(rule.variables(), &["container".to_string(), "port".to_string()]);
    }
}
