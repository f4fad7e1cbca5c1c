use clap::{Parser, Subcommand};
use minisip::{
    message::{build_reply, make_call_id, make_via_branch, random_text, SipEnvelope},
    server::{handler_fn, Server, ServerConfig},
    transport::{udp::parse_datagram, udp::UdpConnection, TransportConfig, TRANSPORT_BUFFER_SIZE},
    Error, Result,
};
use std::{sync::Arc, time::Duration};
use tokio::{select, time::timeout};
use tracing::{debug, info, Level};

#[derive(Parser, Debug)]
#[command(author, version, about = "Minimal SIP endpoint over UDP")]
struct Args {
    /// Log level: error, warn, info, debug or trace
    #[arg(short, long, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer INVITE with 200 OK, swallow REGISTER, 405 everything else
    Serve {
        /// Local address to bind
        #[arg(short, long, default_value = "127.0.0.1:5060")]
        addr: String,

        /// Log every datagram read and written
        #[arg(short, long)]
        debug: bool,

        #[arg(long, default_value = "1500")]
        mtu: usize,

        /// Handler executions allowed to run at the same time
        #[arg(long, default_value = "256")]
        max_concurrency: usize,
    },
    /// Send a demo INVITE to a server and print what comes back
    Probe {
        /// Server address, e.g. 127.0.0.1:5060
        #[arg(short, long, default_value = "127.0.0.1:5060")]
        server: String,

        /// Local address to send from
        #[arg(short, long, default_value = "127.0.0.1:0")]
        bind: String,

        /// Seconds to wait for a reply
        #[arg(short, long, default_value = "3")]
        wait: u64,
    },
}

async fn run_server(addr: String, config: ServerConfig) -> Result<()> {
    let mut server = Server::new(config);

    server.on_register(handler_fn(|req| async move {
        debug!("received REGISTER request from {}", req.source);
        None
    }));
    server.on_invite(handler_fn(|req| async move {
        debug!("received INVITE request from {}", req.source);
        let mut reply = build_reply(&req, 200, "OK").ok()?;
        reply.set_body(vec![]);
        Some(reply)
    }));
    server.add_request_middleware(Arc::new(|req: &mut SipEnvelope| {
        debug!(source = %req.source, "this is a request middleware");
    }));

    select! {
        r = server.listen_and_serve("udp", &addr) => r?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            server.close().await?;
        }
    }
    Ok(())
}

fn demo_invite(local: &str, server: &str) -> String {
    format!(
        "INVITE sip:echo@{server} SIP/2.0\r\n\
         Via: SIP/2.0/UDP {local};branch={branch};rport\r\n\
         Max-Forwards: 70\r\n\
         From: \"Alice\" <sip:alice@sip.example.org>;tag={tag}\r\n\
         To: <sip:bob@sip.example.org>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 INVITE\r\n\
         Contact: <sip:alice@{local}>\r\n\
         User-Agent: minisip\r\n\
         Content-Length: 0\r\n\r\n",
        branch = make_via_branch(),
        tag = random_text(8),
        call_id = make_call_id(),
    )
}

async fn run_probe(server: String, bind: String, wait: u64) -> Result<()> {
    let config = TransportConfig::default();
    let connection = UdpConnection::bind(bind.parse()?, &config).await?;
    let local = connection.local_addr();

    let invite = demo_invite(&local.to_string(), &server);
    let msg = SipEnvelope::new(
        rsip::SipMessage::try_from(invite.as_str())?,
        "udp",
        local.to_string(),
        server.clone(),
    );
    connection.send(&msg).await?;
    println!("--> {}\n{}", server, msg.msg);

    let mut buf = vec![0u8; TRANSPORT_BUFFER_SIZE];
    let (len, from) = timeout(Duration::from_secs(wait), connection.recv_raw(&mut buf))
        .await
        .map_err(|_| Error::Error(format!("no reply from {} within {}s", server, wait)))??;
    match parse_datagram(&buf[..len], "udp", from, local) {
        Some(reply) => println!("<-- {}\n{}", from, reply.msg),
        None => println!("<-- {}: {} bytes, not a SIP message", from, len),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    match args.command {
        Command::Serve {
            addr,
            debug,
            mtu,
            max_concurrency,
        } => {
            let config = ServerConfig::default()
                .with_transport(TransportConfig::default().with_mtu(mtu).with_debug(debug))
                .with_max_concurrency(max_concurrency);
            run_server(addr, config).await
        }
        Command::Probe { server, bind, wait } => run_probe(server, bind, wait).await,
    }
}
