#[cfg(test)]
mod tests {
    use crate::executor::{CommandExecutor, FetchResult};
    use crate::portal::{Portal, ResponseType};
    use crate::session::Session;
    use async_trait::async_trait;
    use relaygate_core::{
        Column, Connection, DataRow, DataSourceRegistry, DataType, DataValue, Execution,
        FormatCode, ParsedStatement, ProbeReport, ReadPreference, RelaygateError, StatementKind,
    };
    use relaygate_discovery::{
        AlgorithmConfig, DiscoveryRule, GroupConfig, ProbeResult, SchemaConfig,
    };
    use relaygate_protocol::BackendMessage;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum Script {
        Update(u64),
        Rows {
            columns: Vec<Column>,
            rows: Vec<DataRow>,
            lose_after: Option<usize>,
        },
        Fail(RelaygateError),
    }

    type GetHook = Box<dyn FnOnce() + Send>;

    #[derive(Default)]
    struct MockRegistry {
        scripts: Mutex<HashMap<String, Script>>,
        gets: AtomicUsize,
        released: Arc<AtomicUsize>,
        executed: Arc<Mutex<Vec<String>>>,
        requested_formats: Arc<Mutex<Vec<Vec<FormatCode>>>>,
        on_get: Mutex<Option<GetHook>>,
    }

    impl MockRegistry {
        fn script(&self, node: &str, script: Script) {
            self.scripts.lock().unwrap().insert(node.to_string(), script);
        }

        fn gets(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().unwrap().clone()
        }

        fn requested_formats(&self) -> Vec<Vec<FormatCode>> {
            self.requested_formats.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DataSourceRegistry for MockRegistry {
        async fn get(&self, node: &str) -> Result<Box<dyn Connection>, RelaygateError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if let Some(hook) = self.on_get.lock().unwrap().take() {
                hook();
            }
            let script = self
                .scripts
                .lock()
                .unwrap()
                .get(node)
                .cloned()
                .ok_or_else(|| RelaygateError::ConnectionLost(format!("{node} is down")))?;
            Ok(Box::new(MockConnection {
                node: node.to_string(),
                script,
                rows: VecDeque::new(),
                fetched: 0,
                released: self.released.clone(),
                executed: self.executed.clone(),
                requested_formats: self.requested_formats.clone(),
            }))
        }

        async fn probe(&self, _node: &str) -> Result<ProbeReport, RelaygateError> {
            Ok(ProbeReport::unreachable())
        }
    }

    struct MockConnection {
        node: String,
        script: Script,
        rows: VecDeque<DataRow>,
        fetched: usize,
        released: Arc<AtomicUsize>,
        executed: Arc<Mutex<Vec<String>>>,
        requested_formats: Arc<Mutex<Vec<Vec<FormatCode>>>>,
    }

    impl Drop for MockConnection {
        fn drop(&mut self) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        fn node(&self) -> &str {
            &self.node
        }

        async fn execute(
            &mut self,
            statement: &ParsedStatement,
            _params: &[DataValue],
            result_formats: &[FormatCode],
        ) -> Result<Execution, RelaygateError> {
            self.executed
                .lock()
                .unwrap()
                .push(format!("{}: {}", self.node, statement.sql));
            self.requested_formats
                .lock()
                .unwrap()
                .push(result_formats.to_vec());
            match &self.script {
                Script::Update(rows) => Ok(Execution::Update {
                    rows_affected: *rows,
                }),
                Script::Rows { columns, rows, .. } => {
                    self.rows = rows.iter().cloned().collect();
                    Ok(Execution::Rows {
                        columns: columns.clone(),
                    })
                }
                Script::Fail(err) => Err(err.clone()),
            }
        }

        async fn next_row(&mut self) -> Result<Option<DataRow>, RelaygateError> {
            if let Script::Rows {
                lose_after: Some(limit),
                ..
            } = &self.script
            {
                if self.fetched >= *limit {
                    return Err(RelaygateError::ConnectionLost(format!(
                        "{} closed the connection",
                        self.node
                    )));
                }
            }
            self.fetched += 1;
            Ok(self.rows.pop_front())
        }

        async fn close(&mut self) -> Result<(), RelaygateError> {
            Ok(())
        }
    }

    fn rule() -> Arc<DiscoveryRule> {
        let schema = SchemaConfig {
            name: "orders".into(),
            groups: vec![GroupConfig {
                name: "g1".into(),
                nodes: vec!["n1".into(), "n2".into(), "n3".into()],
                poll_interval_ms: 1000,
                probe_timeout_ms: 100,
                read_preference: ReadPreference::Primary,
                algorithm: AlgorithmConfig::QuorumReplication,
            }],
        };
        Arc::new(DiscoveryRule::build(&[schema]).unwrap())
    }

    fn promote(rule: &DiscoveryRule, primary: &str, replicas: &[&str]) {
        let result = ProbeResult {
            primary: Some(primary.to_string()),
            replicas: replicas.iter().map(|n| n.to_string()).collect(),
            unreachable: Default::default(),
        };
        rule.apply("orders", "g1", &result).unwrap();
    }

    fn executor(rule: &Arc<DiscoveryRule>, registry: &Arc<MockRegistry>) -> CommandExecutor {
        CommandExecutor::new(rule.clone(), registry.clone(), "orders", "g1")
    }

    fn select(sql: &str) -> Arc<ParsedStatement> {
        Arc::new(ParsedStatement::new(sql, StatementKind::Query, 0))
    }

    fn order_rows(count: i64) -> Script {
        Script::Rows {
            columns: vec![
                Column::new("id", DataType::Int8),
                Column::new("status", DataType::Text),
            ],
            rows: (1..=count)
                .map(|id| DataRow::new(vec![DataValue::text(id.to_string()), DataValue::text("paid")]))
                .collect(),
            lose_after: None,
        }
    }

    #[tokio::test]
    async fn update_reports_rows_affected() {
        let rule = rule();
        promote(&rule, "n2", &["n3"]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n2", Script::Update(5));
        let executor = executor(&rule, &registry);

        let statement = Arc::new(ParsedStatement::new(
            "UPDATE orders SET status = $1 WHERE region = $2",
            StatementKind::Update,
            2,
        ));
        let mut portal = Portal::bind(
            "",
            statement,
            vec![DataValue::text("shipped"), DataValue::text("eu")],
            Vec::new(),
        )
        .unwrap();
        let messages = executor.execute(&mut portal).await.unwrap();
        assert_eq!(
            messages,
            vec![
                BackendMessage::BindComplete,
                BackendMessage::CommandComplete {
                    kind: StatementKind::Update,
                    rows: 5
                }
            ]
        );
        assert_eq!(executor.response_type(&portal), Some(ResponseType::Update));
        assert_eq!(portal.backend(), Some("n2"));
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn query_streams_rows_on_demand() {
        let rule = rule();
        promote(&rule, "n2", &["n3"]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n2", order_rows(3));
        let executor = executor(&rule, &registry);

        let mut portal = Portal::bind("p1", select("SELECT id, status FROM orders"), Vec::new(), Vec::new()).unwrap();
        let messages = executor.execute(&mut portal).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], BackendMessage::BindComplete);
        match &messages[1] {
            BackendMessage::RowDescription { fields } => {
                assert_eq!(fields.len(), 2);
                assert_eq!(fields[0].name, "id");
                assert_eq!(fields[0].format, FormatCode::Text);
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert_eq!(executor.response_type(&portal), Some(ResponseType::Query));
        assert_eq!(portal.rows_fetched(), 0);

        for id in 1..=3 {
            let row = executor.fetch_next(&mut portal).await.unwrap();
            assert_eq!(
                row,
                FetchResult::Row(BackendMessage::DataRow {
                    values: vec![Some(id.to_string().into_bytes()), Some(b"paid".to_vec())]
                })
            );
        }
        assert_eq!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::EndOfResults
        );
        assert_eq!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::EndOfResults
        );
        assert_eq!(portal.rows_fetched(), 3);
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn query_without_columns_returns_no_data() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script(
            "n1",
            Script::Rows {
                columns: Vec::new(),
                rows: Vec::new(),
                lose_after: None,
            },
        );
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind("", select("SELECT"), Vec::new(), Vec::new()).unwrap();
        let messages = executor.execute(&mut portal).await.unwrap();
        assert_eq!(
            messages,
            vec![BackendMessage::BindComplete, BackendMessage::NoData]
        );
        let err = executor.fetch_next(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::PortalState(_)));
    }

    #[tokio::test]
    async fn empty_statement_only_acknowledges_bind() {
        let rule = rule();
        let registry = Arc::new(MockRegistry::default());
        let executor = executor(&rule, &registry);
        let mut portal =
            Portal::bind("", Arc::new(ParsedStatement::empty()), Vec::new(), Vec::new()).unwrap();
        let messages = executor.execute(&mut portal).await.unwrap();
        assert_eq!(messages, vec![BackendMessage::BindComplete]);
        assert_eq!(executor.response_type(&portal), None);
        assert_eq!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::EndOfResults
        );
        assert_eq!(registry.gets(), 0);
    }

    #[tokio::test]
    async fn arity_mismatch_never_reaches_backend() {
        let rule = rule();
        promote(&rule, "n2", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n2", Script::Update(1));
        let statement = Arc::new(ParsedStatement::new(
            "DELETE FROM orders WHERE id = $1 AND region = $2 AND status = $3",
            StatementKind::Delete,
            3,
        ));
        let err = Portal::bind(
            "",
            statement,
            vec![DataValue::text("1"), DataValue::text("eu")],
            Vec::new(),
        )
        .err()
        .unwrap();
        assert_eq!(
            err,
            RelaygateError::BindingArity {
                expected: 3,
                actual: 2
            }
        );
        assert_eq!(registry.gets(), 0);
    }

    #[tokio::test]
    async fn no_primary_means_routing_unavailable() {
        let rule = rule();
        let registry = Arc::new(MockRegistry::default());
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind("", select("SELECT 1"), Vec::new(), Vec::new()).unwrap();
        let err = executor.execute(&mut portal).await.unwrap_err();
        assert_eq!(
            err,
            RelaygateError::RoutingUnavailable {
                schema: "orders".into(),
                group: "g1".into()
            }
        );
        assert_eq!(registry.gets(), 0);
        assert!(!portal.is_executed());
    }

    #[tokio::test]
    async fn backend_error_passes_through_verbatim() {
        let rule = rule();
        promote(&rule, "n2", &[]);
        let registry = Arc::new(MockRegistry::default());
        let backend_error = RelaygateError::Backend {
            code: "23505".into(),
            message: "duplicate key value violates unique constraint \"orders_pkey\"".into(),
        };
        registry.script("n2", Script::Fail(backend_error.clone()));
        let executor = executor(&rule, &registry);
        let statement = Arc::new(ParsedStatement::new(
            "INSERT INTO orders (id) VALUES ($1)",
            StatementKind::Insert,
            1,
        ));
        let mut portal =
            Portal::bind("", statement, vec![DataValue::Binary(7i32.to_be_bytes().to_vec())], Vec::new()).unwrap();
        let err = executor.execute(&mut portal).await.unwrap_err();
        assert_eq!(err, backend_error);
        assert_eq!(
            err.to_string(),
            "duplicate key value violates unique constraint \"orders_pkey\""
        );

        // A failed portal stays unusable.
        let again = executor.fetch_next(&mut portal).await.unwrap_err();
        assert!(matches!(again, RelaygateError::PortalState(_)));
        assert!(executor.execute(&mut portal).await.is_err());
        assert_eq!(registry.gets(), 1);
    }

    #[tokio::test]
    async fn lost_connection_surfaces_on_next_fetch() {
        let rule = rule();
        promote(&rule, "n2", &[]);
        let registry = Arc::new(MockRegistry::default());
        let Script::Rows { columns, rows, .. } = order_rows(5) else {
            unreachable!()
        };
        registry.script(
            "n2",
            Script::Rows {
                columns,
                rows,
                lose_after: Some(2),
            },
        );
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind("", select("SELECT * FROM orders"), Vec::new(), Vec::new()).unwrap();
        executor.execute(&mut portal).await.unwrap();
        assert!(matches!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::Row(_)
        ));
        assert!(matches!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::Row(_)
        ));
        let err = executor.fetch_next(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::ConnectionLost(_)));
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn fetch_before_execute_is_rejected() {
        let rule = rule();
        let registry = Arc::new(MockRegistry::default());
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind("", select("SELECT 1"), Vec::new(), Vec::new()).unwrap();
        let err = executor.fetch_next(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::PortalState(_)));
    }

    #[tokio::test]
    async fn replica_preference_routes_reads_to_replica() {
        let rule = rule();
        promote(&rule, "n1", &["n2", "n3"]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n3", order_rows(1));
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind("", select("SELECT * FROM orders"), Vec::new(), Vec::new())
            .unwrap()
            .with_read_preference(ReadPreference::Replica, Some("n3".into()));
        executor.execute(&mut portal).await.unwrap();
        assert_eq!(portal.backend(), Some("n3"));
        assert_eq!(registry.executed(), vec!["n3: SELECT * FROM orders"]);
    }

    #[tokio::test]
    async fn writes_ignore_replica_preference() {
        let rule = rule();
        promote(&rule, "n1", &["n2"]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", Script::Update(1));
        let executor = executor(&rule, &registry);
        let statement = Arc::new(ParsedStatement::new(
            "DELETE FROM orders",
            StatementKind::Delete,
            0,
        ));
        let mut portal = Portal::bind("", statement, Vec::new(), Vec::new())
            .unwrap()
            .with_read_preference(ReadPreference::Replica, None);
        executor.execute(&mut portal).await.unwrap();
        assert_eq!(portal.backend(), Some("n1"));
    }

    #[tokio::test]
    async fn binary_result_format_encodes_by_type() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", order_rows(1));
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind(
            "",
            select("SELECT id, status FROM orders"),
            Vec::new(),
            vec![FormatCode::Binary, FormatCode::Text],
        )
        .unwrap();
        executor.execute(&mut portal).await.unwrap();
        assert_eq!(
            executor.fetch_next(&mut portal).await.unwrap(),
            FetchResult::Row(BackendMessage::DataRow {
                values: vec![Some(1i64.to_be_bytes().to_vec()), Some(b"paid".to_vec())]
            })
        );
    }

    #[tokio::test]
    async fn backend_cells_in_requested_format_pass_through() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        let shipped_on = vec![0, 0, 0x22, 0x5e];
        registry.script(
            "n1",
            Script::Rows {
                columns: vec![
                    Column::new("shipped_on", DataType::from_oid(1082)),
                    Column::new("weight", DataType::Float8),
                ],
                rows: vec![
                    DataRow::new(vec![DataValue::Binary(shipped_on.clone()), DataValue::text("1e+100")]),
                    DataRow::new(vec![DataValue::Null, DataValue::text("Infinity")]),
                    DataRow::new(vec![DataValue::Null, DataValue::text("1.5e-10")]),
                ],
                lose_after: None,
            },
        );
        let executor = executor(&rule, &registry);
        let formats = vec![FormatCode::Binary, FormatCode::Text];
        let mut portal = Portal::bind(
            "",
            select("SELECT shipped_on, weight FROM orders"),
            Vec::new(),
            formats.clone(),
        )
        .unwrap();
        executor.execute(&mut portal).await.unwrap();
        assert_eq!(registry.requested_formats(), vec![formats]);

        let mut cells = Vec::new();
        while let FetchResult::Row(BackendMessage::DataRow { values }) =
            executor.fetch_next(&mut portal).await.unwrap()
        {
            cells.push(values);
        }
        assert_eq!(
            cells,
            vec![
                vec![Some(shipped_on), Some(b"1e+100".to_vec())],
                vec![None, Some(b"Infinity".to_vec())],
                vec![None, Some(b"1.5e-10".to_vec())],
            ]
        );
    }

    #[tokio::test]
    async fn binary_request_on_text_only_cell_fails_fetch() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script(
            "n1",
            Script::Rows {
                columns: vec![Column::new("shipped_on", DataType::from_oid(1082))],
                rows: vec![DataRow::new(vec![DataValue::text("2024-01-31")])],
                lose_after: None,
            },
        );
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind(
            "",
            select("SELECT shipped_on FROM orders"),
            Vec::new(),
            vec![FormatCode::Binary],
        )
        .unwrap();
        executor.execute(&mut portal).await.unwrap();
        let err = executor.fetch_next(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::Protocol(_)));
        assert!(executor.fetch_next(&mut portal).await.is_err());
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn mismatched_format_count_fails_execute() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", order_rows(1));
        let executor = executor(&rule, &registry);
        let mut portal = Portal::bind(
            "",
            select("SELECT id, status FROM orders"),
            Vec::new(),
            vec![FormatCode::Binary, FormatCode::Text, FormatCode::Text],
        )
        .unwrap();
        let err = executor.execute(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::Protocol(_)));
        assert_eq!(registry.released(), 1);
    }

    #[tokio::test]
    async fn write_returning_rows_completes_with_count() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", order_rows(2));
        let executor = executor(&rule, &registry);
        let statement = Arc::new(ParsedStatement::new(
            "INSERT INTO orders (status) VALUES ('new'), ('new') RETURNING id",
            StatementKind::Insert,
            0,
        ));
        let mut portal = Portal::bind("", statement, Vec::new(), Vec::new()).unwrap();
        let messages = executor.execute(&mut portal).await.unwrap();
        assert_eq!(
            messages[1],
            BackendMessage::CommandComplete {
                kind: StatementKind::Insert,
                rows: 2
            }
        );
        assert_eq!(executor.response_type(&portal), Some(ResponseType::Update));
    }

    #[tokio::test]
    async fn stale_primary_is_retried_once_on_refreshed_topology() {
        let rule = rule();
        promote(&rule, "n1", &["n2"]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", Script::Update(1));
        registry.script("n2", Script::Update(1));
        let failover = rule.clone();
        *registry.on_get.lock().unwrap() = Some(Box::new(move || promote(&failover, "n2", &["n1"])));

        let mut session = Session::new(Arc::new(executor(&rule, &registry)));
        let statement = Arc::new(ParsedStatement::new(
            "UPDATE orders SET status = 'paid'",
            StatementKind::Update,
            0,
        ));
        session
            .bind(Portal::bind("", statement, Vec::new(), Vec::new()).unwrap())
            .await;
        let messages = session.execute("").await.unwrap();
        assert_eq!(messages[0], BackendMessage::BindComplete);
        assert_eq!(registry.gets(), 2);
        assert_eq!(
            registry.executed(),
            vec!["n2: UPDATE orders SET status = 'paid'"]
        );
        assert_eq!(session.portal("").and_then(Portal::backend), Some("n2"));
    }

    #[tokio::test]
    async fn read_only_rejection_marks_topology_stale() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script(
            "n1",
            Script::Fail(RelaygateError::Backend {
                code: "25006".into(),
                message: "cannot execute UPDATE in a read-only transaction".into(),
            }),
        );
        let executor = executor(&rule, &registry);
        let statement = Arc::new(ParsedStatement::new(
            "UPDATE orders SET status = 'paid'",
            StatementKind::Update,
            0,
        ));
        let mut portal = Portal::bind("", statement, Vec::new(), Vec::new()).unwrap();
        let err = executor.execute(&mut portal).await.unwrap_err();
        assert!(matches!(err, RelaygateError::StaleTopology { .. }));
        assert!(!portal.is_executed());
    }

    #[tokio::test]
    async fn closing_session_releases_suspended_cursors() {
        let rule = rule();
        promote(&rule, "n1", &[]);
        let registry = Arc::new(MockRegistry::default());
        registry.script("n1", order_rows(10));
        let mut session = Session::new(Arc::new(executor(&rule, &registry)));
        for name in ["a", "b"] {
            let portal =
                Portal::bind(name, select("SELECT * FROM orders"), Vec::new(), Vec::new()).unwrap();
            session.bind(portal).await;
            session.execute(name).await.unwrap();
            session.fetch_next(name).await.unwrap();
        }
        assert_eq!(registry.released(), 0);

        assert!(session.close_portal("a").await);
        assert!(!session.close_portal("a").await);
        assert_eq!(registry.released(), 1);

        drop(session);
        assert_eq!(registry.released(), 2);
    }

    #[tokio::test]
    async fn executing_unknown_portal_fails() {
        let rule = rule();
        let registry = Arc::new(MockRegistry::default());
        let mut session = Session::new(Arc::new(executor(&rule, &registry)));
        let err = session.execute("missing").await.unwrap_err();
        assert!(matches!(err, RelaygateError::PortalState(_)));
    }
}
