use anyhow::{Context, bail};
use clap::Parser;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use campus_allocator::api::codec::RequestCodec;
use campus_allocator::api::protocol::{Message, ProgramRequest, ResStatus};
use campus_allocator::config::CLIENT_TIMEOUT;
use campus_allocator::logger;

/// Academic program client: sends one reservation request to its faculty
/// gateway and prints the final RES.
#[derive(Parser, Debug)]
#[command(name = "program")]
struct Args {
    programa: String,
    salones: u32,
    laboratorios: u32,

    /// Faculty gateway endpoint.
    #[arg(long, default_value = "127.0.0.1:6000")]
    endpoint: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logger::init("program");

    println!("PROGRAMA {}", args.programa.to_uppercase());
    println!("| Salones: {}  Labs: {}", args.salones, args.laboratorios);
    println!("| Endpoint: {}", args.endpoint);

    let stream = tokio::time::timeout(CLIENT_TIMEOUT, TcpStream::connect(&args.endpoint))
        .await
        .context("la facultad no respondió (connect)")?
        .context("connecting to the faculty gateway")?;
    let mut framed = Framed::new(stream, RequestCodec::new());

    let request = ProgramRequest { programa: args.programa, salones: args.salones, laboratorios: args.laboratorios };
    framed.send(request).await.context("sending the request")?;

    let reply = match tokio::time::timeout(CLIENT_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(Message::Res(res)))) => res,
        Ok(Some(Ok(other))) => bail!("mensaje inesperado de la facultad: {:?}", other),
        Ok(Some(Err(e))) => bail!("respuesta ilegible de la facultad: {}", e),
        Ok(None) => bail!("la facultad cerró la conexión sin responder"),
        Err(_) => bail!("timeout: la facultad no respondió"),
    };

    println!("RESPUESTA FINAL");
    println!("| Estado: {}", reply.status);
    println!("| Transacción: {}", reply.transaction_id);
    match (reply.status, reply.proposal()) {
        (ResStatus::Accepted, Some(proposal)) => {
            println!("| Salones: {}, Labs: {}", proposal.salones_propuestos, proposal.laboratorios_propuestos);
            println!("| Aulas móviles: {}", proposal.aulas_moviles);
        }
        _ => println!("| Razón: {}", reply.reason.as_deref().unwrap_or("N/A")),
    }

    if !reply.status.is_accepted() {
        std::process::exit(1);
    }
    Ok(())
}
