//! Hangar command line client
//!
//! Usage:
//!   hangar-cli --port 5005 demo
//!   hangar-cli list
//!   hangar-cli put penguins data/penguins.csv
//!   hangar-cli get penguins --limit 10
//!   hangar-cli shutdown

use std::fs::File;
use std::io::Seek;
use std::path::PathBuf;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::csv::reader::Format;
use arrow::csv::ReaderBuilder;
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::pretty::pretty_format_batches;
use clap::{Parser, Subcommand};

use hangar::{ClientConfig, HangarClient};

type CliResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "hangar-cli")]
#[command(about = "Put, get and manage tables on a Hangar server")]
#[command(version)]
struct Args {
    /// Server host
    #[arg(long, default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 5005)]
    port: u16,

    /// Split outgoing batches longer than this many rows
    #[arg(long, default_value_t = 64 * 1024)]
    max_batch_rows: usize,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stored tables with row and byte counts
    List,
    /// Show schema, size and ticket of one table
    Describe { name: String },
    /// Fetch a table and print it
    Get {
        name: String,
        /// Print at most this many rows
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Upload a CSV file (header row required) as a table
    Put { name: String, csv: PathBuf },
    /// Remove a table
    Drop { name: String },
    /// Remove every table
    Clear,
    Healthcheck,
    /// Ask the server to stop
    Shutdown,
    /// List the server's administrative actions
    Actions,
    /// Store and read back a small example table named `chars`
    Demo,
}

fn read_csv(path: &PathBuf) -> CliResult<Vec<RecordBatch>> {
    let mut file = File::open(path)?;
    let (schema, _) = Format::default()
        .with_header(true)
        .infer_schema(&mut file, Some(1000))?;
    file.rewind()?;

    let reader = ReaderBuilder::new(Arc::new(schema))
        .with_header(true)
        .build(file)?;
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(batches)
}

fn chars_table() -> CliResult<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("name", DataType::Utf8, false),
        Field::new("species", DataType::Utf8, true),
        Field::new("height", DataType::Int64, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(StringArray::from(vec![
            "Luke Skywalker",
            "C-3PO",
            "R2-D2",
            "Darth Vader",
            "Leia Organa",
        ])),
        Arc::new(StringArray::from(vec![
            Some("Human"),
            Some("Droid"),
            Some("Droid"),
            Some("Human"),
            None,
        ])),
        Arc::new(Int64Array::from(vec![
            Some(172),
            Some(167),
            Some(96),
            Some(202),
            Some(150),
        ])),
    ];
    Ok(RecordBatch::try_new(schema, columns)?)
}

async fn run(args: Args) -> CliResult<()> {
    let config = ClientConfig {
        host: args.host,
        port: args.port,
        max_batch_rows: args.max_batch_rows,
        ..ClientConfig::default()
    };
    let mut client = HangarClient::connect(config).await?;

    match args.command {
        Command::List => {
            for info in client.list_infos().await? {
                println!(
                    "{:<24} {:>10} rows {:>12} bytes",
                    info.name, info.num_rows, info.byte_size
                );
            }
        }
        Command::Describe { name } => {
            let info = client.describe_table(&name).await?;
            println!("name:      {}", info.name);
            println!("key:       {}", info.key);
            println!("rows:      {}", info.num_rows);
            println!("bytes:     {}", info.byte_size);
            println!("ticket:    {}", info.ticket);
            println!("locations: {}", info.locations.join(", "));
            println!("schema:");
            for field in info.schema.fields() {
                println!(
                    "  {}: {}{}",
                    field.name(),
                    field.data_type(),
                    if field.is_nullable() { "" } else { " not null" }
                );
            }
        }
        Command::Get { name, limit } => {
            let table = client.get_table(&name).await?;
            let shown = match limit {
                Some(n) if n < table.num_rows() => table.slice(0, n),
                _ => table.clone(),
            };
            println!("{}", pretty_format_batches(&[shown])?);
            println!("{} rows", table.num_rows());
        }
        Command::Put { name, csv } => {
            let batches = read_csv(&csv)?;
            let receipt = client.put_table(&name, &batches).await?;
            println!(
                "stored {}: {} rows in {} batches, {} bytes{}",
                name,
                receipt.rows,
                receipt.batches,
                receipt.bytes,
                if receipt.replaced { " (replaced)" } else { "" }
            );
        }
        Command::Drop { name } => {
            client.drop_table(&name).await?;
            println!("dropped {}", name);
        }
        Command::Clear => {
            let dropped = client.clear().await?;
            println!("dropped {} tables", dropped);
        }
        Command::Healthcheck => {
            client.healthcheck().await?;
            println!("ok");
        }
        Command::Shutdown => {
            client.shutdown().await?;
            println!("server acknowledged shutdown");
        }
        Command::Actions => {
            for (name, description) in client.list_actions().await? {
                println!("{:<12} {}", name, description);
            }
        }
        Command::Demo => {
            let chars = chars_table()?;
            client.put_table("chars", &[chars]).await?;
            println!("tables: {:?}", client.list_tables().await?);
            let table = client.get_table("chars").await?;
            println!("{}", pretty_format_batches(&[table])?);
            client.drop_table("chars").await?;
            println!("tables after drop: {:?}", client.list_tables().await?);
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    if let Err(e) = run(args).await {
        eprintln!("hangar-cli: {}", e);
        std::process::exit(1);
    }
}
