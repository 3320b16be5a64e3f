use std::collections::HashMap;
use std::net::IpAddr;

/// A dynamically typed input value. Front-ends submit strings, integers, or
/// addresses; the receiving field decides whether the variant is acceptable.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Addr(IpAddr),
}

impl Value {
    /// The string form sketch fields ingest. Addresses use their canonical
    /// textual form; integers are not coerced.
    pub(crate) fn as_sketch_item(&self) -> Option<String> {
        match self {
            Value::Str(s) => Some(s.clone()),
            Value::Addr(a) => Some(a.to_string()),
            Value::Int(_) => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<IpAddr> for Value {
    fn from(a: IpAddr) -> Self {
        Value::Addr(a)
    }
}

/// The statistic a field maintains per window, which also fixes the accepted
/// input variants and the merge operator between windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Additive counter; accepts integers, merges by sum.
    Int,
    /// Windowed maximum; accepts integers, merges by max.
    Max,
    /// Cardinality sketch over string values; merges by register max.
    Hll,
    /// Heavy-hitter count sketch over string values; merges by addition.
    CountMin,
    /// Exact small set of strings; merges by union.
    DistinctStrings,
}

impl FieldKind {
    pub fn parse(s: &str) -> Result<FieldKind, crate::Error> {
        match s {
            "int" => Ok(FieldKind::Int),
            "max" => Ok(FieldKind::Max),
            "hll" => Ok(FieldKind::Hll),
            "countmin" => Ok(FieldKind::CountMin),
            "distinct_strings" => Ok(FieldKind::DistinctStrings),
            other => Err(crate::Error::UnknownFieldType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Int => "int",
            FieldKind::Max => "max",
            FieldKind::Hll => "hll",
            FieldKind::CountMin => "countmin",
            FieldKind::DistinctStrings => "distinct_strings",
        }
    }
}

/// Field name to kind, fixed per store.
pub type FieldSchema = HashMap<String, FieldKind>;

/// Parse `(name, type)` pairs as they appear in configuration.
pub fn parse_field_schema<'a, I>(pairs: I) -> Result<FieldSchema, crate::Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut schema = FieldSchema::new();
    for (name, kind) in pairs {
        schema.insert(name.to_string(), FieldKind::parse(kind)?);
    }
    Ok(schema)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_kinds() {
        let schema = parse_field_schema([
            ("countLogins", "int"),
            ("diffPasswords", "hll"),
            ("countries", "distinct_strings"),
        ])
        .unwrap();
        assert_eq!(schema["countLogins"], FieldKind::Int);
        assert_eq!(schema["diffPasswords"], FieldKind::Hll);
        assert_eq!(schema["countries"], FieldKind::DistinctStrings);

        assert!(parse_field_schema([("x", "bogus")]).is_err());
    }

    #[test]
    fn sketch_item_coercion() {
        assert_eq!(
            Value::from("198.51.100.1".parse::<IpAddr>().unwrap())
                .as_sketch_item()
                .unwrap(),
            "198.51.100.1"
        );
        assert_eq!(Value::from(7).as_sketch_item(), None);
    }
}
