use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use precios_core::Category;
use precios_ingest::{
    check_images, check_stores, clean_database, load_store_registry, maybe_build_scheduler,
    populate_stores, recategorize, update_categories, IngestConfig, IngestPipeline,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "precios-cli")]
#[command(about = "Venezuelan retail price scraping and backend maintenance")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape one search term and persist products and prices
    Scrape {
        search_term: String,
        /// Category override; skips keyword classification
        #[arg(long)]
        category: Option<Category>,
    },
    /// Run the configured search terms on the configured cron schedule
    Schedule,
    /// Insert seed stores from a registry file
    PopulateStores {
        #[arg(long, default_value = "stores.yaml")]
        registry: PathBuf,
    },
    /// Reclassify every stored product by keyword
    UpdateCategories,
    /// Force a category on specific product ids
    Recategorize {
        category: Category,
        #[arg(required = true)]
        ids: Vec<Uuid>,
    },
    /// Delete all prices, products and bucket images
    Clean,
    /// Audit stored image URLs against the bucket contents
    CheckImages,
    /// List stores and the seeded municipalities
    CheckStores,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = IngestConfig::from_env()?;
    let pipeline = IngestPipeline::from_config(config)?;

    match cli.command {
        Commands::Scrape {
            search_term,
            category,
        } => {
            let summary = pipeline.run_scrape(&search_term, category).await?;
            println!(
                "scrape complete: run_id={} cards={} accepted={} products={} prices={} skipped={} reports={}",
                summary.run_id,
                summary.cards_seen,
                summary.cards_accepted,
                summary.products_saved,
                summary.prices_saved,
                summary.skipped,
                summary.reports_dir
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(pipeline);
            match maybe_build_scheduler(pipeline.clone()).await? {
                Some(sched) => {
                    sched.start().await.context("starting scheduler")?;
                    println!(
                        "scheduler running (cron: {}); Ctrl+C to stop",
                        pipeline.config().scrape_cron
                    );
                    tokio::signal::ctrl_c().await?;
                }
                None => eprintln!("scheduler disabled; set PRECIOS_SCHEDULER_ENABLED=1"),
            }
        }
        Commands::PopulateStores { registry } => {
            let registry = load_store_registry(&registry).await?;
            let summary = populate_stores(pipeline.backend(), &registry).await?;
            println!(
                "stores: inserted={} failed={} total={}",
                summary.inserted, summary.failed, summary.total_in_backend
            );
        }
        Commands::UpdateCategories => {
            let summary = update_categories(pipeline.backend(), pipeline.classifier()).await?;
            println!(
                "categories: scanned={} changed={} alimentos={} farmacia={}",
                summary.scanned, summary.changed, summary.alimentos, summary.farmacia
            );
        }
        Commands::Recategorize { category, ids } => {
            let names = recategorize(pipeline.backend(), &ids, category).await?;
            for name in &names {
                println!("{name} -> {category}");
            }
            println!("{} products recategorized", names.len());
        }
        Commands::Clean => {
            let summary =
                clean_database(pipeline.backend(), &pipeline.config().image_bucket).await?;
            println!(
                "cleaned: prices={} products={} images={}",
                summary.prices_deleted, summary.products_deleted, summary.images_deleted
            );
        }
        Commands::CheckImages => {
            let audit = check_images(
                pipeline.backend(),
                &pipeline.config().image_bucket,
                &pipeline.config().backend_url,
            )
            .await?;
            for sampled in &audit.sample {
                println!("{}: {}", sampled.name, sampled.image_url);
            }
            println!(
                "bucket_objects={} hosted={} external={}",
                audit.bucket_objects, audit.hosted_urls, audit.external_urls
            );
        }
        Commands::CheckStores => {
            let audit = check_stores(pipeline.backend()).await?;
            println!("{} stores:", audit.stores.len());
            for store in &audit.stores {
                println!("- {} ({})", store.name, store.id);
            }
            for region in &audit.regions {
                println!("{}:", region.state);
                for municipality in &region.municipalities {
                    println!("   - {municipality}");
                }
            }
        }
    }

    Ok(())
}
