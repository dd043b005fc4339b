//  This Source Code Form is subject to the terms of
//  the Mozilla Public License, v. 2.0. If a copy of the
//  MPL was not distributed with this file, You can
//  obtain one at https://mozilla.org/MPL/2.0/.

//! Predicates deciding which actions of a manifest apply to an image.
//!
//! Three kinds exist: caller supplied expressions such as
//! `arch=i386 & (zone=global | zone=nonglobal)`, the image variants and the
//! image facets. A manifest is always filtered by the conjunction of all of
//! them.

use crate::actions::Action;
use miette::Diagnostic;
use pest::iterators::Pair;
use pest::Parser;
use pest_derive::Parser;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum FilterError {
    #[error("invalid filter expression {expr:?}")]
    #[diagnostic(
        code(ips::filter_error::invalid_expression),
        help("Filters look like 'attr=value', combined with '&', '|' and parentheses")
    )]
    InvalidExpression {
        expr: String,
        #[source]
        source: Box<pest::error::Error<Rule>>,
    },
}

type Result<T> = std::result::Result<T, FilterError>;

#[derive(Parser)]
#[grammar = "filter.pest"]
struct FilterParser;

/// Parsed form of a filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Clause { attr: String, value: String },
    And(Vec<Expr>),
    Or(Vec<Expr>),
}

impl Expr {
    fn from_pair(pair: Pair<'_, Rule>) -> Expr {
        match pair.as_rule() {
            Rule::clause => {
                let mut inner = pair.into_inner();
                let attr = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                let value = inner.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                Expr::Clause { attr, value }
            }
            Rule::group => match pair.into_inner().next() {
                Some(inner) => Expr::from_pair(inner),
                None => Expr::And(vec![]),
            },
            Rule::conjunction => Expr::collapse(pair, Expr::And),
            Rule::expr => Expr::collapse(pair, Expr::Or),
            _ => Expr::And(vec![]),
        }
    }

    fn collapse(pair: Pair<'_, Rule>, join: fn(Vec<Expr>) -> Expr) -> Expr {
        let mut parts: Vec<Expr> = pair.into_inner().map(Expr::from_pair).collect();
        if parts.len() == 1 {
            parts.remove(0)
        } else {
            join(parts)
        }
    }

    fn eval(&self, action: &Action) -> bool {
        match self {
            Expr::Clause { attr, value } => attr_matches(action, attr, value),
            Expr::And(parts) => parts.iter().all(|p| p.eval(action)),
            Expr::Or(parts) => parts.iter().any(|p| p.eval(action)),
        }
    }
}

/// An action lacking the attribute is not constrained by the clause.
fn attr_matches(action: &Action, attr: &str, value: &str) -> bool {
    if let Some(v) = action.attr(attr) {
        return v.values().contains(&value);
    }
    match action.attributes().get(attr) {
        Some(v) => v.values().contains(&value),
        None => true,
    }
}

/// Image variant settings, e.g. `variant.arch=i386`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variants(pub BTreeMap<String, String>);

impl Variants {
    /// Every `variant.*` tag of the action must agree with the image. Debug
    /// variants the image does not set only admit their `false` side.
    pub fn allow_action(&self, action: &Action) -> bool {
        action
            .attrs
            .iter()
            .filter(|(k, _)| k.starts_with("variant."))
            .all(|(k, v)| match self.0.get(k) {
                Some(image_value) => v.values().contains(&image_value.as_str()),
                None if k.starts_with("variant.debug.") => v.values().contains(&"false"),
                None => true,
            })
    }
}

/// Image facet settings. Keys may end in `*` to cover a subtree, e.g.
/// `facet.locale.*=false`; the longest matching key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facets(pub BTreeMap<String, bool>);

impl Facets {
    pub fn is_enabled(&self, facet: &str) -> bool {
        if let Some(v) = self.0.get(facet) {
            return *v;
        }
        self.0
            .iter()
            .filter_map(|(k, v)| {
                let prefix = k.strip_suffix('*')?;
                facet.starts_with(prefix).then_some((prefix.len(), *v))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, v)| v)
            .unwrap_or(true)
    }

    /// An action tagged with facets is installed when any of its tags is
    /// enabled in the image.
    pub fn allow_action(&self, action: &Action) -> bool {
        let mut tags = action
            .attrs
            .iter()
            .filter(|(k, v)| k.starts_with("facet.") && v.values().contains(&"true"))
            .peekable();
        if tags.peek().is_none() {
            return true;
        }
        tags.any(|(k, _)| self.is_enabled(k))
    }
}

/// A compiled action predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Expr { text: String, expr: Expr },
    Variants(Variants),
    Facets(Facets),
}

impl Filter {
    pub fn matches(&self, action: &Action) -> bool {
        match self {
            Filter::Expr { expr, .. } => expr.eval(action),
            Filter::Variants(v) => v.allow_action(action),
            Filter::Facets(f) => f.allow_action(action),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Expr { text, .. } => write!(f, "{}", text),
            Filter::Variants(v) => {
                let parts: Vec<String> = v.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
                write!(f, "{}", parts.join(" & "))
            }
            Filter::Facets(facets) => {
                let parts: Vec<String> = facets
                    .0
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                write!(f, "{}", parts.join(" & "))
            }
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        compile_filter(s)
    }
}

pub fn compile_filter(text: &str) -> Result<Filter> {
    let mut pairs =
        FilterParser::parse(Rule::filter, text).map_err(|e| FilterError::InvalidExpression {
            expr: text.to_string(),
            source: Box::new(e),
        })?;
    let expr = pairs
        .next()
        .and_then(|filter| filter.into_inner().find(|p| p.as_rule() == Rule::expr))
        .map(Expr::from_pair)
        .unwrap_or(Expr::And(vec![]));
    Ok(Filter::Expr {
        text: text.trim().to_string(),
        expr,
    })
}

/// True when every filter admits the action.
pub fn apply_filters(action: &Action, filters: &[Filter]) -> bool {
    filters.iter().all(|f| f.matches(action))
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn act(s: &str) -> Action {
        s.parse().unwrap()
    }

    #[test]
    fn simple_clause() {
        let f = compile_filter("arch=i386").unwrap();
        assert!(f.matches(&act("file path=a arch=i386")));
        assert!(!f.matches(&act("file path=a arch=sparc")));
        // untagged actions pass
        assert!(f.matches(&act("file path=a")));
    }

    #[test]
    fn precedence_and_groups() {
        let f = compile_filter("arch=i386 & zone=global | debug=true").unwrap();
        assert!(f.matches(&act("dir path=a arch=i386 zone=global")));
        assert!(!f.matches(&act("dir path=a arch=i386 zone=nonglobal debug=false")));
        assert!(f.matches(&act("dir path=a arch=sparc zone=nonglobal debug=true")));

        let g = compile_filter("arch=i386 & (zone=global | debug=true)").unwrap();
        assert!(!g.matches(&act("dir path=a arch=sparc zone=nonglobal debug=true")));
        assert!(g.matches(&act("dir path=a arch=i386 zone=nonglobal debug=true")));
        assert_eq!(g.to_string(), "arch=i386 & (zone=global | debug=true)");
    }

    #[test]
    fn typed_attributes_are_visible() {
        let f = compile_filter("mode=0755").unwrap();
        assert!(f.matches(&act("dir path=a mode=0755")));
        assert!(!f.matches(&act("dir path=a mode=0700")));
    }

    #[test]
    fn bad_expressions() {
        assert!(compile_filter("arch").is_err());
        assert!(compile_filter("arch=i386 &").is_err());
        assert!(compile_filter("(arch=i386").is_err());
    }

    #[test]
    fn variants() {
        let v = Variants(btreemap! {"variant.arch".to_string() => "i386".to_string()});
        assert!(v.allow_action(&act("file path=a variant.arch=i386")));
        assert!(!v.allow_action(&act("file path=a variant.arch=sparc")));
        assert!(v.allow_action(&act("file path=a variant.opensolaris.zone=global")));
        assert!(!v.allow_action(&act("file path=a variant.debug.osnet=true")));
        assert!(v.allow_action(&act("file path=a variant.debug.osnet=false")));
    }

    #[test]
    fn facets() {
        let f = Facets(btreemap! {
            "facet.doc".to_string() => false,
            "facet.locale.*".to_string() => false,
            "facet.locale.de".to_string() => true,
        });
        assert!(!f.allow_action(&act("file path=a facet.doc=true")));
        assert!(f.allow_action(&act("file path=a facet.devel=true")));
        assert!(!f.allow_action(&act("file path=a facet.locale.fr=true")));
        assert!(f.allow_action(&act("file path=a facet.locale.de=true")));
        // any enabled tag admits the action
        assert!(f.allow_action(&act("file path=a facet.doc=true facet.devel=true")));
    }

    #[test]
    fn conjunction_of_filters() {
        let filters = vec![
            compile_filter("zone=global").unwrap(),
            Filter::Variants(Variants(btreemap! {"variant.arch".to_string() => "i386".to_string()})),
        ];
        assert!(apply_filters(&act("file path=a variant.arch=i386"), &filters));
        assert!(!apply_filters(&act("file path=a variant.arch=i386 zone=nonglobal"), &filters));
        assert!(!apply_filters(&act("file path=a variant.arch=sparc"), &filters));
    }
}
