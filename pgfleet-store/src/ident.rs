//! SQL identifier quoting for statements that cannot use bind parameters
//! (DDL and identifiers interpolated into generated queries).

/// Quote a single identifier, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified name (`schema.relation` or bare
/// `relation`), quoting each part separately. Only the first dot separates
/// the schema; metric names may themselves contain dots.
pub fn quote_qualified(name: &str) -> String {
    match name.split_once('.') {
        Some((schema, relation)) => format!("{}.{}", quote_ident(schema), quote_ident(relation)),
        None => quote_ident(name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quotes_plain_identifiers() {
        assert_eq!(quote_ident("db_stats"), "\"db_stats\"");
    }

    #[test]
    fn doubles_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn splits_schema_from_relation() {
        assert_eq!(
            quote_qualified("subpartitions.wal_y2023w46"),
            "\"subpartitions\".\"wal_y2023w46\""
        );
        assert_eq!(quote_qualified("db_stats"), "\"db_stats\"");
    }
}
