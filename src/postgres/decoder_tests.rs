#[cfg(test)]
mod tests {
    use super::super::decoder::*;
    use super::super::lsn::Lsn;
    use super::super::test_utils::MockMessageBuilder;
    use super::super::types::ChangeKind;
    use crate::Error;
    use serde_json::json;

    fn decoder_with_users() -> (PgOutputDecoder, MockMessageBuilder) {
        let builder = MockMessageBuilder::new();
        let mut decoder = PgOutputDecoder::new();
        let relation = builder.users_relation();
        assert!(decoder.decode(Lsn(1), &relation).unwrap().is_none());
        (decoder, builder)
    }

    #[test]
    fn test_relation_is_cached() {
        let (decoder, _) = decoder_with_users();
        let relation = decoder.relation(16384).expect("relation should be cached");
        assert_eq!(relation.schema, "public");
        assert_eq!(relation.table, "users");
        assert_eq!(relation.columns.len(), 2);
        assert!(relation.columns[0].is_key);
        assert_eq!(relation.columns[1].type_id, 25);
    }

    #[test]
    fn test_begin_and_commit() {
        let (mut decoder, builder) = decoder_with_users();

        let begin = decoder
            .decode(Lsn(100), &builder.begin(300, 42))
            .unwrap()
            .unwrap();
        assert_eq!(begin.kind, ChangeKind::Begin);
        assert_eq!(begin.position, Lsn(300));
        assert_eq!(begin.xid, Some(42));
        assert_eq!(begin.commit_position, Some(Lsn(300)));
        assert_eq!(begin.ts_ms, Some(1_697_369_400_000));

        let commit = decoder
            .decode(Lsn(300), &builder.commit(290, 300))
            .unwrap()
            .unwrap();
        assert_eq!(commit.kind, ChangeKind::Commit);
        assert_eq!(commit.position, Lsn(300));
        assert_eq!(commit.xid, Some(42));
    }

    #[test]
    fn test_insert() {
        let (mut decoder, builder) = decoder_with_users();
        decoder.decode(Lsn(10), &builder.begin(30, 7)).unwrap();

        let event = decoder
            .decode(Lsn(11), &builder.insert(16384, &[Some("1"), Some("Alice")]))
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.position, Lsn(30));
        assert_eq!(event.xid, Some(7));
        assert_eq!(event.qualified_table().as_deref(), Some("public.users"));
        assert_eq!(event.columns["id"], json!(1));
        assert_eq!(event.columns["name"], json!("Alice"));
        assert!(event.old.is_none());
    }

    #[test]
    fn test_positions_follow_the_transaction() {
        let (mut decoder, builder) = decoder_with_users();
        decoder.decode(Lsn(100), &builder.begin(300, 1)).unwrap();
        let insert = decoder
            .decode(Lsn(105), &builder.insert(16384, &[Some("1"), Some("a")]))
            .unwrap()
            .unwrap();
        let commit = decoder
            .decode(Lsn(300), &builder.commit(300, 320))
            .unwrap()
            .unwrap();
        assert_eq!(insert.position, Lsn(300));
        assert_eq!(commit.position, Lsn(320));

        // Outside a transaction the WAL position is used again.
        let stray = decoder
            .decode(Lsn(400), &builder.insert(16384, &[Some("2"), Some("b")]))
            .unwrap()
            .unwrap();
        assert_eq!(stray.position, Lsn(400));
    }

    #[test]
    fn test_insert_with_null() {
        let (mut decoder, builder) = decoder_with_users();
        let event = decoder
            .decode(Lsn(11), &builder.insert(16384, &[Some("2"), None]))
            .unwrap()
            .unwrap();
        assert_eq!(event.columns["name"], serde_json::Value::Null);
    }

    #[test]
    fn test_update_with_old_tuple() {
        let (mut decoder, builder) = decoder_with_users();
        let event = decoder
            .decode(
                Lsn(20),
                &builder.update(
                    16384,
                    Some((b'O', &[Some("1"), Some("Alice")])),
                    &[Some("1"), Some("Alicia")],
                ),
            )
            .unwrap()
            .unwrap();

        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.columns["name"], json!("Alicia"));
        let old = event.old.expect("old tuple");
        assert_eq!(old["name"], json!("Alice"));
    }

    #[test]
    fn test_update_without_old_tuple() {
        let (mut decoder, builder) = decoder_with_users();
        let event = decoder
            .decode(Lsn(20), &builder.update(16384, None, &[Some("1"), Some("Bob")]))
            .unwrap()
            .unwrap();
        assert!(event.old.is_none());
        assert_eq!(event.columns["name"], json!("Bob"));
    }

    #[test]
    fn test_delete() {
        let (mut decoder, builder) = decoder_with_users();
        let event = decoder
            .decode(Lsn(30), &builder.delete(16384, &[Some("1"), None]))
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::Delete);
        assert_eq!(event.columns["id"], json!(1));
        assert_eq!(event.old.as_ref().unwrap()["id"], json!(1));
    }

    #[test]
    fn test_unknown_relation_is_a_decode_error() {
        let builder = MockMessageBuilder::new();
        let mut decoder = PgOutputDecoder::new();
        let result = decoder.decode(Lsn(5), &builder.insert(999, &[Some("1")]));
        assert!(matches!(result, Err(Error::StreamDecode { .. })));
    }

    #[test]
    fn test_truncated_messages_fail_without_panicking() {
        let (mut decoder, builder) = decoder_with_users();
        let full = builder.insert(16384, &[Some("1"), Some("Alice")]);
        for len in 1..full.len() {
            let result = decoder.decode(Lsn(5), &full[..len]);
            assert!(
                matches!(result, Err(Error::StreamDecode { .. })),
                "prefix of length {} should fail",
                len
            );
        }

        let begin = builder.begin(10, 1);
        assert!(decoder.decode(Lsn(5), &begin[..10]).is_err());
    }

    #[test]
    fn test_column_count_mismatch() {
        let (mut decoder, builder) = decoder_with_users();
        let result = decoder.decode(Lsn(5), &builder.insert(16384, &[Some("1")]));
        assert!(matches!(result, Err(Error::StreamDecode { .. })));
    }

    #[test]
    fn test_unknown_message_type() {
        let mut decoder = PgOutputDecoder::new();
        assert!(decoder.decode(Lsn(1), b"Z").is_err());
        assert!(decoder.decode(Lsn(1), b"").unwrap().is_none());
    }

    #[test]
    fn test_value_parsing() {
        assert_eq!(parse_postgres_value("t", 16), json!(true));
        assert_eq!(parse_postgres_value("f", 16), json!(false));
        assert_eq!(parse_postgres_value("9876543210", 20), json!(9876543210i64));
        assert_eq!(parse_postgres_value("2.5", 701), json!(2.5));
        assert_eq!(parse_postgres_value("NaN", 701), json!("NaN"));
        assert_eq!(parse_postgres_value(r#"{"a":[1,2]}"#, 3802), json!({"a": [1, 2]}));
        assert_eq!(parse_postgres_value("12.50", 1700), json!("12.50"));
        assert_eq!(parse_postgres_value("abc", 23), json!("abc"));
    }
}
