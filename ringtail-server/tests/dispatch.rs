//! Dispatch scenarios driven through the real client stack: reactor-backed
//! connections and framed requests against a live server.

use std::{io::Write as _, net::SocketAddr, sync::Arc};

use ringtail::{
    conn::Connection,
    messages::{Command, CommandResult, Request},
    reactor::Reactor,
    settings::{AgentDetails, ServerDetails, Settings},
    wire::Framer,
    RingtailError,
};
use ringtail_server::{ResultStore, RingtailServer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct TestServer {
    addr: SocketAddr,
    intake: ResultStore,
    shutdown: CancellationToken,
    running: JoinHandle<()>,
}

async fn start_server(tasking: Option<Vec<Command>>) -> TestServer {
    let settings = Settings {
        server: ServerDetails {
            host: "127.0.0.1".into(),
            port: 0,
        },
        agent: AgentDetails {
            workers: 1,
            poll_interval_secs: 1,
            id: None,
        },
    };
    let mut server = RingtailServer::with_settings(&settings).await.unwrap();
    if let Some(batch) = tasking {
        server.set_tasking(batch);
    }
    let addr = server.local_addr().unwrap();
    let intake = server.intake();
    let shutdown = server.shutdown_handle();
    let running = tokio::spawn(async move { server.run().await.unwrap() });
    TestServer {
        addr,
        intake,
        shutdown,
        running,
    }
}

impl TestServer {
    async fn connect(&self, reactor: &Arc<Reactor>) -> Framer<Connection> {
        let conn = Connection::open(Arc::clone(reactor), "127.0.0.1", self.addr.port())
            .await
            .unwrap();
        Framer::new(conn)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.running.await.unwrap();
    }
}

#[tokio::test]
async fn direct_read_file_streams_the_content() {
    let mut tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.write_all(b"streamed by the server").unwrap();
    let path = tmp.path().to_str().unwrap().to_string();

    let server = start_server(None).await;
    let reactor = Arc::new(Reactor::new(8).unwrap());

    let mut framer = server.connect(&reactor).await;
    framer
        .send(&Request::ReadFile {
            agent_id: "tester".into(),
            path: path.clone(),
        })
        .await
        .unwrap();
    let result: CommandResult = framer.receive().await.unwrap();
    framer.into_inner().close().await.unwrap();

    assert_eq!(result.command_id, format!("file-read-{path}"));
    assert_eq!(result.return_code, 0);
    assert_eq!(result.output, b"streamed by the server");

    server.stop().await;
}

#[tokio::test]
async fn direct_read_of_missing_path_reports_failure() {
    let server = start_server(None).await;
    let reactor = Arc::new(Reactor::new(8).unwrap());

    let mut framer = server.connect(&reactor).await;
    framer
        .send(&Request::ReadFile {
            agent_id: "tester".into(),
            path: "/no/such/file".into(),
        })
        .await
        .unwrap();
    let result: CommandResult = framer.receive().await.unwrap();

    assert_eq!(result.return_code, 1);
    assert!(String::from_utf8_lossy(&result.output).contains("Failed to open file"));

    server.stop().await;
}

#[tokio::test]
async fn list_commands_returns_the_configured_batch() {
    let batch = vec![
        Command::ReadFile {
            id: "r1".into(),
            path: "/tmp/a".into(),
        },
        Command::ReadFile {
            id: "r2".into(),
            path: "/tmp/b".into(),
        },
    ];
    let server = start_server(Some(batch.clone())).await;
    let reactor = Arc::new(Reactor::new(8).unwrap());

    let mut framer = server.connect(&reactor).await;
    framer
        .send(&Request::ListCommands {
            agent_id: "tester".into(),
        })
        .await
        .unwrap();
    let received: Vec<Command> = framer.receive().await.unwrap();

    assert_eq!(received, batch);

    server.stop().await;
}

#[tokio::test]
async fn report_results_is_recorded_without_a_reply() {
    let server = start_server(None).await;
    let reactor = Arc::new(Reactor::new(8).unwrap());

    let reported = vec![
        CommandResult::success("c1", b"out".to_vec()),
        CommandResult::failure("c2", "Failed to open file: ENOENT"),
    ];
    let mut framer = server.connect(&reactor).await;
    framer
        .send(&Request::ReportResults {
            agent_id: "agent-7".into(),
            results: reported.clone(),
        })
        .await
        .unwrap();

    // No reply: the server records and closes, so the next read sees a clean
    // end of stream.
    let reply = framer.receive::<CommandResult>().await;
    assert!(matches!(
        reply,
        Err(RingtailError::Wire(ringtail::wire::WireError::Truncated))
    ));

    assert_eq!(server.intake.take("agent-7"), reported);

    server.stop().await;
}
