use postgres_protocol::escape::{escape_identifier, escape_literal};

/// `"schema"."relation"`
pub fn quote_qualified(schema: &str, relation: &str) -> String {
    format!("{}.{}", escape_identifier(schema), escape_identifier(relation))
}

/// Storage parameter names may carry a namespace (`toast.fillfactor`); each
/// part is quoted on its own or the server would treat the dot as part of the name.
pub fn quote_parameter(name: &str) -> String {
    match name.split_once('.') {
        Some((namespace, parameter)) => {
            format!("{}.{}", escape_identifier(namespace), escape_identifier(parameter))
        }
        None => escape_identifier(name),
    }
}

pub fn quote_value(value: &str) -> String {
    escape_literal(value)
}

/// `keyword` is the object type of the ALTER (`table`, `materialized view`).
pub fn alter_set_statement(keyword: &str, relation: &str, parameter: &str, value: &str) -> String {
    format!(
        "alter {} {} set ({} = {})",
        keyword,
        relation,
        quote_parameter(parameter),
        quote_value(value)
    )
}

pub fn alter_reset_statement(keyword: &str, relation: &str, parameter: &str) -> String {
    format!("alter {} {} reset ({})", keyword, relation, quote_parameter(parameter))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_parameter() {
        assert_eq!(quote_parameter("fillfactor"), "\"fillfactor\"");
        assert_eq!(quote_parameter("toast.autovacuum_enabled"), "\"toast\".\"autovacuum_enabled\"");
        assert_eq!(quote_parameter("bad\"name"), "\"bad\"\"name\"");
    }

    #[test]
    fn test_quote_value() {
        assert_eq!(quote_value("0.01"), "'0.01'");
        assert_eq!(quote_value("it's"), "'it''s'");
    }

    #[test]
    fn test_statements() {
        let rel = quote_qualified("public", "orders");
        assert_eq!(
            alter_set_statement("table", &rel, "fillfactor", "80"),
            "alter table \"public\".\"orders\" set (\"fillfactor\" = '80')"
        );
        assert_eq!(
            alter_reset_statement("materialized view", &rel, "toast.autovacuum_enabled"),
            "alter materialized view \"public\".\"orders\" reset (\"toast\".\"autovacuum_enabled\")"
        );
    }

    #[test]
    fn test_injection_is_contained() {
        let stmt = alter_set_statement("table", "t", "fillfactor", "1); drop table x; --");
        assert!(stmt.ends_with("'1); drop table x; --')"));
    }
}
