//! Filter
//!
//! Free-text record filter. The text is split on `+` into terms, each either
//! `field:value` or a bare value, optionally prefixed with `!` to exclude.
//!
//! - Values of the same field are ORed, distinct fields are ANDed.
//! - A bare value matches if any default column contains it; every bare
//!   value must match.
//! - Every exclusion must hold.
//!
//! Matching is a case-insensitive substring test. There is no escaping,
//! nesting or OR operator.

use super::record::ParsedRecord;
use crate::enrich::Enrichment;

use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Timestamp,
    Protocol,
    HostSet,
    IpSet,
    /// Host-set, or the ip-set when there is none; the sort's "set" column.
    Set,
    Domain,
    Source,
    Destination,
    SourceAlias,
    /// Organization name resolved from the destination address.
    Asn,
}

/// Columns searched by bare terms.
const DEFAULT_COLUMNS: [Field; 7] = [
    Field::HostSet,
    Field::IpSet,
    Field::Domain,
    Field::Source,
    Field::Protocol,
    Field::Destination,
    Field::Asn,
];

impl Field {
    pub fn from_name(name: &str) -> Option<Field> {
        let field = match name.trim().to_ascii_lowercase().as_str() {
            "time" | "timestamp" => Field::Timestamp,
            "proto" | "protocol" => Field::Protocol,
            "host" | "hostset" => Field::HostSet,
            "set" => Field::Set,
            "ip" | "ipset" => Field::IpSet,
            "domain" => Field::Domain,
            "src" | "source" => Field::Source,
            "dst" | "dest" | "destination" => Field::Destination,
            "alias" | "sourcealias" => Field::SourceAlias,
            "asn" => Field::Asn,
            _ => return None,
        };
        Some(field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// All values given for one field, in order of appearance.
    Field { field: Field, values: Vec<String> },
    Global { value: String },
    /// `!field:value` or `!value` (field `None`).
    Exclude { field: Option<Field>, value: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterQuery {
    terms: Vec<Term>,
}

impl FilterQuery {
    pub fn parse(text: &str) -> FilterQuery {
        let mut terms: Vec<Term> = Vec::new();

        for piece in text.split('+') {
            let piece = piece.trim();
            let (negated, body) = match piece.strip_prefix('!') {
                Some(rest) => (true, rest.trim()),
                None => (false, piece),
            };

            let (field, value) = match body.split_once(':') {
                Some((name, value)) => match Field::from_name(name) {
                    Some(field) => (Some(field), value.trim()),
                    None => (None, body),
                },
                None => (None, body),
            };
            if value.is_empty() {
                continue;
            }
            let value = value.to_lowercase();

            match (negated, field) {
                (true, field) => terms.push(Term::Exclude { field, value }),
                (false, None) => terms.push(Term::Global { value }),
                (false, Some(field)) => {
                    let group = terms.iter_mut().find_map(|t| match t {
                        Term::Field { field: f, values } if *f == field => Some(values),
                        _ => None,
                    });
                    match group {
                        Some(values) => values.push(value),
                        None => terms.push(Term::Field {
                            field,
                            values: vec![value],
                        }),
                    }
                }
            }
        }

        FilterQuery { terms }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// True if the query matches everything.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn matches(&self, record: &ParsedRecord, enrich: &mut dyn Enrichment) -> bool {
        if self.terms.is_empty() {
            return true;
        }
        let mut row = Row {
            record,
            enrich,
            asn: None,
        };
        self.terms.iter().all(|term| match term {
            Term::Field { field, values } => values.iter().any(|v| row.contains(*field, v)),
            Term::Global { value } => row.any_default_contains(value),
            Term::Exclude {
                field: Some(field),
                value,
            } => !row.contains(*field, value),
            Term::Exclude { field: None, value } => !row.any_default_contains(value),
        })
    }

    /// Records matching the query, in their original order.
    pub fn apply(
        &self,
        records: &[Arc<ParsedRecord>],
        enrich: &mut dyn Enrichment,
    ) -> Vec<Arc<ParsedRecord>> {
        records
            .iter()
            .filter(|r| self.matches(r, enrich))
            .cloned()
            .collect()
    }
}

/// One record under evaluation, resolving the organization name at most
/// once and only if a term needs it.
struct Row<'r, 'e> {
    record: &'r ParsedRecord,
    enrich: &'e mut dyn Enrichment,
    asn: Option<Option<Arc<str>>>,
}

impl Row<'_, '_> {
    fn attribute(&mut self, field: Field) -> Option<&str> {
        let r = self.record;
        let value = match field {
            Field::Timestamp => r.timestamp.as_str(),
            Field::Protocol => r.protocol.as_str(),
            Field::HostSet => r.host_set.as_str(),
            Field::IpSet => r.ip_set.as_str(),
            Field::Set => r.set(),
            Field::Domain => r.domain.as_str(),
            Field::Source => r.source.as_str(),
            Field::Destination => r.destination.as_str(),
            Field::SourceAlias => r.source_alias.as_str(),
            Field::Asn => {
                if self.asn.is_none() {
                    self.asn = Some(self.enrich.resolve(&r.destination));
                }
                return self.asn.as_ref().and_then(|name| name.as_deref());
            }
        };
        Some(value)
    }

    fn contains(&mut self, field: Field, needle: &str) -> bool {
        self.attribute(field)
            .map(|value| value.to_lowercase().contains(needle))
            .unwrap_or(false)
    }

    fn any_default_contains(&mut self, needle: &str) -> bool {
        DEFAULT_COLUMNS.iter().any(|&field| self.contains(field, needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{parse_line, RawLine};
    use crate::enrich::{Entity, EnrichmentIndex, NoEnrichment, Resolver};

    fn record(line: &str) -> ParsedRecord {
        parse_line(&RawLine::from(line)).unwrap()
    }

    fn pair() -> (ParsedRecord, ParsedRecord) {
        (
            record("t,TCP,,a.com,src1,,1.1.1.1:443"),
            record("t,UDP,,b.com,src2,,2.2.2.2:53"),
        )
    }

    #[test]
    fn groups_values_by_field() {
        let q = FilterQuery::parse("domain:a.com + proto:udp+domain:B.COM+tcp");
        assert_eq!(
            q.terms(),
            &[
                Term::Field {
                    field: Field::Domain,
                    values: vec!["a.com".into(), "b.com".into()]
                },
                Term::Field {
                    field: Field::Protocol,
                    values: vec!["udp".into()]
                },
                Term::Global { value: "tcp".into() },
            ]
        );
    }

    #[test]
    fn blank_and_unknown_field_terms() {
        assert!(FilterQuery::parse("   ").is_empty());
        assert!(FilterQuery::parse("++domain:+!").is_empty());
        assert_eq!(
            FilterQuery::parse("1.2.3.4:443").terms(),
            &[Term::Global {
                value: "1.2.3.4:443".into()
            }]
        );
    }

    #[test]
    fn and_across_fields_or_within() {
        let (a, b) = pair();
        let mut none = NoEnrichment;

        let q = FilterQuery::parse("tcp+domain:a.com");
        assert!(q.matches(&a, &mut none));
        assert!(!q.matches(&b, &mut none));

        let q = FilterQuery::parse("a.com+b.com");
        assert!(!q.matches(&a, &mut none));
        assert!(!q.matches(&b, &mut none));

        let q = FilterQuery::parse("domain:a.com+domain:b.com");
        assert!(q.matches(&a, &mut none));
        assert!(q.matches(&b, &mut none));
    }

    #[test]
    fn set_field_matches_the_sorted_set_column() {
        let host = record("t,TCP,hosts,a.com,src,,dst");
        let ip = record("t,TCP,,b.com,src,vpn,dst");
        let mut none = NoEnrichment;

        let q = FilterQuery::parse("set:vpn");
        assert!(q.matches(&ip, &mut none));
        assert!(!q.matches(&host, &mut none));
        assert!(FilterQuery::parse("set:hosts").matches(&host, &mut none));
        assert!(!FilterQuery::parse("host:vpn").matches(&ip, &mut none));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let (a, _) = pair();
        assert!(FilterQuery::parse("").matches(&a, &mut NoEnrichment));
    }

    #[test]
    fn exclusions() {
        let (a, b) = pair();
        let mut none = NoEnrichment;
        let q = FilterQuery::parse("!proto:udp");
        assert!(q.matches(&a, &mut none));
        assert!(!q.matches(&b, &mut none));

        let q = FilterQuery::parse("!src1");
        assert!(!q.matches(&a, &mut none));
        assert!(q.matches(&b, &mut none));
    }

    #[test]
    fn asn_field_goes_through_enrichment() {
        let (a, b) = pair();
        let mut resolver = Resolver::new(EnrichmentIndex::from_entities([Entity {
            id: "cf".into(),
            name: "Cloudflare".into(),
            prefixes: vec!["1.1.1.0/24".into()],
        }]));

        let q = FilterQuery::parse("asn:cloud");
        assert!(q.matches(&a, &mut resolver));
        assert!(!q.matches(&b, &mut resolver));

        let q = FilterQuery::parse("flare");
        assert!(q.matches(&a, &mut resolver));
        assert!(!q.matches(&a, &mut NoEnrichment));
    }

    #[test]
    fn apply_keeps_order() {
        let (a, b) = pair();
        let records = vec![Arc::new(b), Arc::new(a)];
        let out = FilterQuery::parse(".com").apply(&records, &mut NoEnrichment);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].domain, "b.com");
    }
}
