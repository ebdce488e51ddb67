//! CLI for salesbus
//!
//! Subcommands:
//! - `server`: run the broker
//! - `inventory`: run the inventory service against a broker
//! - `publish-sale`: publish one `venda.registrada` event
//! - `check-stock`: ask inventory for stock over request/response

use std::error::Error;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use clap::Parser;
use rust_decimal::Decimal;
use tracing::{error, info};

use salesbus::broker::Broker;
use salesbus::bus::{MessageBus, RpcClient, TypeRegistry, serve_requests};
use salesbus::config::{Settings, load_config};
use salesbus::events::{
    EstoqueVerificadoResponse, ProdutoCriadoEvent, VendaRegistradaEvent, VerificarEstoqueCommand,
    queues,
};
use salesbus::inventory::StockLedger;
use salesbus::persistence::Persistence;
use salesbus::transport::start_websocket_server;
use salesbus::utils::logging;

#[derive(Parser)]
#[command(name = "salesbus")]
enum Command {
    /// Start the broker
    Server,
    /// Keep stock in step with sales until interrupted
    Inventory,
    /// Publish a sale
    PublishSale {
        #[arg(long)]
        venda_id: i32,
        #[arg(long)]
        produto_id: i32,
        #[arg(long)]
        quantidade: i32,
        #[arg(long)]
        cliente: String,
        #[arg(long)]
        valor_total: Decimal,
    },
    /// Ask inventory whether a quantity is available
    CheckStock {
        #[arg(long)]
        produto_id: i32,
        #[arg(long)]
        quantidade: i32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = Command::parse();

    let settings = match load_config() {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    logging::init(&settings.log.level);

    let result = match cmd {
        Command::Server => run_server(settings).await,
        Command::Inventory => run_inventory(settings).await,
        Command::PublishSale {
            venda_id,
            produto_id,
            quantidade,
            cliente,
            valor_total,
        } => {
            let sale = VendaRegistradaEvent {
                venda_id,
                produto_id,
                quantidade,
                cliente,
                data_venda: Utc::now(),
                valor_total,
            };
            publish_sale(settings, sale).await
        }
        Command::CheckStock {
            produto_id,
            quantidade,
        } => check_stock(settings, produto_id, quantidade).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(settings: Settings) -> Result<(), Box<dyn Error>> {
    let broker = match &settings.server.data_dir {
        Some(dir) => {
            info!(data_dir = %dir, "opening broker storage");
            Broker::with_persistence(Persistence::open(dir)?)?
        }
        None => Broker::new(),
    }
    .shared();

    let addr = settings.server.addr();
    tokio::select! {
        result = start_websocket_server(addr, broker, settings.clone()) => {
            result?;
            error!("WebSocket server exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    Ok(())
}

async fn run_inventory(settings: Settings) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::connect(&settings.messaging, TypeRegistry::standard()).await?;
    let ledger = Arc::new(Mutex::new(StockLedger::new()));

    let stock = ledger.clone();
    let products = bus
        .subscribe(queues::PRODUTO_CRIADO, move |event: ProdutoCriadoEvent| {
            lock(&stock).register_product(&event);
            async { Ok::<(), String>(()) }
        })
        .await?;

    let stock = ledger.clone();
    let publisher = bus.publisher();
    let sales = bus
        .subscribe(queues::VENDA_REGISTRADA, move |event: VendaRegistradaEvent| {
            let change = lock(&stock).apply_sale(&event);
            let publisher = publisher.clone();
            async move {
                let change = change.map_err(|e| e.to_string())?;
                publisher
                    .publish(queues::ESTOQUE_ALTERADO, &change)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok::<(), String>(())
            }
        })
        .await?;

    let stock = ledger.clone();
    let checks = serve_requests(
        &bus,
        queues::VERIFICAR_ESTOQUE,
        queues::ESTOQUE_VERIFICADO,
        move |command: VerificarEstoqueCommand| {
            let response = lock(&stock).check(&command);
            async move { Ok::<_, String>(response) }
        },
    )
    .await?;

    info!("inventory service running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");

    checks.shutdown().await;
    sales.shutdown().await;
    products.shutdown().await;
    bus.disconnect().await?;
    Ok(())
}

async fn publish_sale(settings: Settings, sale: VendaRegistradaEvent) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::connect(&settings.messaging, TypeRegistry::standard()).await?;
    let message_id = bus.publish(queues::VENDA_REGISTRADA, &sale).await?;
    println!("published sale {} as message {message_id}", sale.venda_id);
    bus.disconnect().await?;
    Ok(())
}

async fn check_stock(
    settings: Settings,
    produto_id: i32,
    quantidade: i32,
) -> Result<(), Box<dyn Error>> {
    let bus = MessageBus::connect(&settings.messaging, TypeRegistry::standard()).await?;
    let client: RpcClient<VerificarEstoqueCommand, EstoqueVerificadoResponse> =
        RpcClient::start(&bus, queues::VERIFICAR_ESTOQUE, queues::ESTOQUE_VERIFICADO).await?;

    let result = client
        .request(VerificarEstoqueCommand {
            produto_id,
            quantidade_solicitada: quantidade,
            correlation_id: String::new(),
        })
        .await;

    client.shutdown().await;
    bus.disconnect().await?;

    let response = result?;
    println!(
        "{} (available: {}, sufficient: {})",
        response.mensagem, response.quantidade_disponivel, response.disponibilidade_suficiente
    );
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
