//! Interactive shell that fetches files from a serving host over the direct
//! request mode: one connection, one `ReadFile` request, one streamed reply.

use std::{error::Error, fmt::Display, sync::Arc};

use ringtail::{
    conn::Connection,
    messages::{CommandResult, Request},
    reactor::Reactor,
    settings::Settings,
    wire::Framer,
};
use shellfish::{async_fn, handler::DefaultAsyncHandler, Command, Shell};

pub type CmdResult<T> = std::result::Result<T, Box<dyn Error>>;

pub struct ShellState {
    reactor: Arc<Reactor>,
    settings: Settings,
    requester_id: String,
}

impl ShellState {
    pub fn new(reactor: Arc<Reactor>, settings: Settings, requester_id: String) -> Self {
        ShellState {
            reactor,
            settings,
            requester_id,
        }
    }
}

impl Display for ShellState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}:{}]> ",
            self.settings.server.host, self.settings.server.port
        )
    }
}

pub fn get_shell(
    state: ShellState,
) -> Shell<'static, ShellState, impl Display, DefaultAsyncHandler> {
    let mut shell = Shell::new_async(state, "[ringtail]> ");

    shell.commands.insert(
        "get",
        Command::new_async(
            "fetch a file from the serving host".into(),
            async_fn!(ShellState, get),
        ),
    );

    shell
}

async fn get(state: &mut ShellState, args: Vec<String>) -> CmdResult<()> {
    if args.len() != 2 {
        println!("usage: get <path>");
        return Ok(());
    }
    let path = args[1].clone();

    // One connection per request; the server hangs up after replying.
    let conn = Connection::open(
        Arc::clone(&state.reactor),
        &state.settings.server.host,
        state.settings.server.port,
    )
    .await?;
    let mut framer = Framer::new(conn);
    framer
        .send(&Request::ReadFile {
            agent_id: state.requester_id.clone(),
            path: path.clone(),
        })
        .await?;
    let result: CommandResult = framer.receive().await?;
    framer.into_inner().close().await?;

    if result.is_success() {
        println!("--- {path} ---");
        print!("{}", String::from_utf8_lossy(&result.output));
        println!("--- end of {path} ---");
    } else {
        println!("error: {}", String::from_utf8_lossy(&result.output));
    }

    Ok(())
}
