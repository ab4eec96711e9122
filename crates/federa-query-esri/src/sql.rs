//! `where` parameter rendering

use federa_query::{ClauseValue, DataError, Operator, QueryClause, Result};

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn literal(clause: &QueryClause) -> Result<String> {
    match &clause.value {
        ClauseValue::Null => Ok("NULL".to_string()),
        ClauseValue::Boolean(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        ClauseValue::Number(n) => Ok(n.to_string()),
        ClauseValue::String(s) => Ok(quote(s)),
        ClauseValue::Variable(name) => Err(DataError::InvalidQuery(format!(
            "Unresolved variable {{{}}} in clause on {}",
            name, clause.field_name
        ))),
    }
}

fn render_clause(clause: &QueryClause) -> Result<String> {
    let field = &clause.field_name;
    if clause.value.is_null() {
        return match clause.operator {
            Operator::Eq => Ok(format!("{} IS NULL", field)),
            Operator::Ne => Ok(format!("{} IS NOT NULL", field)),
            other => Err(DataError::InvalidQuery(format!(
                "Operator {} cannot compare {} with null",
                other, field
            ))),
        };
    }

    let value = literal(clause)?;
    Ok(match clause.operator {
        Operator::Like => format!("{} LIKE {}", field, value),
        Operator::ILike => format!("UPPER({}) LIKE UPPER({})", field, value),
        op => format!("{} {} {}", field, op.as_str(), value),
    })
}

/// SQL-92 where clause joining all clauses with `AND`; `1=1` when empty
pub fn where_clause(clauses: &[QueryClause]) -> Result<String> {
    if clauses.is_empty() {
        return Ok("1=1".to_string());
    }
    let parts = clauses.iter().map(render_clause).collect::<Result<Vec<_>>>()?;
    Ok(parts.join(" AND "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use federa_query::parse_attribute_query;

    #[test]
    fn test_where_clause() {
        let clauses = parse_attribute_query(
            "[owner] = 'O'Brien' & [height] >= 12.5 & [status] = null & [live] = true & [name] ilike 'p%'",
        );
        assert_eq!(
            where_clause(&clauses).unwrap(),
            "owner = 'O''Brien' AND height >= 12.5 AND status IS NULL AND live = 1 AND UPPER(name) LIKE UPPER('p%')"
        );
    }

    #[test]
    fn test_not_null_and_like() {
        let clauses = vec![
            QueryClause::new("removed", Operator::Ne, ClauseValue::Null),
            QueryClause::new("code", Operator::Like, ClauseValue::from("AB%")),
        ];
        assert_eq!(
            where_clause(&clauses).unwrap(),
            "removed IS NOT NULL AND code LIKE 'AB%'"
        );
        assert_eq!(where_clause(&[]).unwrap(), "1=1");
    }

    #[test]
    fn test_unresolved_variable_rejected() {
        let clauses = vec![QueryClause::new(
            "owner",
            Operator::Eq,
            ClauseValue::Variable("user".to_string()),
        )];
        assert!(matches!(where_clause(&clauses), Err(DataError::InvalidQuery(_))));
    }
}
