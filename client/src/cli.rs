use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ingest_common::{
    config::master_base_url,
    executor::LocalExecutor,
    ingestion_workflow, ingestion_workflow_with_uris,
    runner::CloudStageRunner,
    stages::{storage::BucketStore, warehouse::InMemoryWarehouse},
    IngestConfig, RunInfo, RunStatus, WorkerMetrics, WorkflowDefinition,
};
use reqwest::{Client, StatusCode};
use std::{env, path::PathBuf, sync::Arc};

#[derive(Parser)]
#[command(name = "ingest-client")]
#[command(about = "CLI para el pipeline de ingesta de MovieLens")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispara una corrida manual en el master
    Trigger,
    /// Consulta el estado de una corrida
    Status {
        #[arg(value_name = "RUN_ID")]
        id: String,
    },
    /// Lista las corridas conocidas por el master
    Runs,
    /// Lista los workers y sus métricas
    Workers,
    /// Muestra el grafo del workflow (sin hablar con el master)
    Graph,
    /// Ejecuta el workflow completo en este proceso
    RunLocal {
        /// Directorio que hace de bucket; las tablas se declaran en memoria
        #[arg(long, value_name = "DIR")]
        local_root: Option<PathBuf>,

        /// Pisa INGEST_HOME
        #[arg(long, value_name = "DIR")]
        home: Option<PathBuf>,
    },
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Trigger => {
            let url = format!("{}/api/v1/runs", base_url);
            let resp = client.post(&url).send().await?;
            match resp.status() {
                s if s.is_success() => {
                    let run: RunInfo = resp.json().await?;
                    println!("Corrida creada:");
                    print_run(&run);
                }
                StatusCode::CONFLICT => {
                    println!("Ya hay una corrida activa; no se disparó otra.");
                }
                s => bail!("el master respondió {s} al disparar la corrida"),
            }
        }

        Commands::Status { id } => {
            let url = format!("{}/api/v1/runs/{}", base_url, id);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let run: RunInfo = resp.json().await?;
                print_run(&run);
            } else {
                println!("Error: corrida no encontrada (status {})", resp.status());
            }
        }

        Commands::Runs => {
            let url = format!("{}/api/v1/runs", base_url);
            let runs: Vec<RunInfo> = client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;
            if runs.is_empty() {
                println!("No hay corridas.");
            }
            for r in runs {
                println!(
                    "{}  {:<10} {:<9} {}/{} ok, {} fallidas  ({})",
                    r.id,
                    format!("{:?}", r.status),
                    format!("{:?}", r.trigger),
                    r.completed_tasks,
                    r.total_tasks,
                    r.failed_tasks,
                    r.submitted_at
                );
            }
        }

        Commands::Workers => {
            let url = format!("{}/api/v1/workers", base_url);
            let resp = client.get(&url).send().await?;
            if resp.status().is_success() {
                let workers: Vec<WorkerMetrics> = resp.json().await?;
                if workers.is_empty() {
                    println!("No hay workers registrados.");
                }
                for w in workers {
                    print_worker(&w);
                }
            } else {
                println!(
                    "Error consultando /api/v1/workers (status {})",
                    resp.status()
                );
            }
        }

        Commands::Graph => {
            let cfg = IngestConfig::from_lookup(graph_lookup)?;
            print!("{}", render_graph(&ingestion_workflow(&cfg)));
        }

        Commands::RunLocal { local_root, home } => {
            let mut cfg = IngestConfig::from_env().context("configuración de la corrida local")?;
            if let Some(home) = home {
                cfg.home = home;
            }
            let (workflow, runner, warehouse) = match &local_root {
                Some(root) => {
                    let storage = BucketStore::local(&cfg.bucket, root)?;
                    // las tablas tienen que apuntar a los archivos locales
                    let workflow =
                        ingestion_workflow_with_uris(&cfg, |object| storage.uri_for(object));
                    let warehouse = Arc::new(InMemoryWarehouse::new());
                    let runner = CloudStageRunner::new(
                        storage,
                        warehouse.clone(),
                        cfg.upload,
                        cfg.strict_convert,
                    );
                    (workflow, runner, Some(warehouse))
                }
                None => (
                    ingestion_workflow(&cfg),
                    CloudStageRunner::from_config(&cfg).await?,
                    None,
                ),
            };

            let run = LocalExecutor::new(Arc::new(runner))
                .execute(&workflow)
                .await?;
            print_run(&run);

            if let (Some(root), Some(warehouse)) = (local_root, warehouse) {
                println!("Objetos en {}", root.display());
                println!("Tablas declaradas:");
                for (name, table) in warehouse.tables() {
                    println!(
                        "  {} -> {}",
                        name,
                        table.external_data_configuration.source_uris.join(", ")
                    );
                }
            }

            if run.status != RunStatus::Succeeded {
                bail!("la corrida {} terminó en {:?}", run.id, run.status);
            }
        }
    }

    Ok(())
}

/// Para mostrar el grafo no hacen falta credenciales reales.
fn graph_lookup(name: &str) -> Option<String> {
    env::var(name).ok().or_else(|| match name {
        "GCP_PROJECT_ID" => Some("<GCP_PROJECT_ID>".to_string()),
        "GCP_GCS_BUCKET" => Some("<GCP_GCS_BUCKET>".to_string()),
        _ => None,
    })
}

fn render_graph(wf: &WorkflowDefinition) -> String {
    let mut out = format!(
        "workflow {} (schedule={:?}, catchup={}, retries={}, owner={})\n",
        wf.id, wf.schedule, wf.catchup, wf.default_args.retries, wf.default_args.owner
    );
    let order = match wf.dag.topological_order() {
        Ok(order) => order,
        Err(e) => return format!("{out}grafo inválido: {e}\n"),
    };
    for id in order {
        let Some(node) = wf.dag.node(&id) else {
            continue;
        };
        let upstream = wf.dag.upstream_of(&id);
        if upstream.is_empty() {
            out.push_str(&format!("  {} [{}]\n", id, node.stage.op_name()));
        } else {
            out.push_str(&format!(
                "  {} [{}] <- {}\n",
                id,
                node.stage.op_name(),
                upstream.join(", ")
            ));
        }
    }
    out
}

fn print_run(run: &RunInfo) {
    println!("Corrida:");
    println!("  id: {}", run.id);
    println!("  workflow: {}", run.workflow_id);
    println!("  estado: {:?} ({:?})", run.status, run.trigger);
    println!(
        "  tareas: total={}, completadas={}, fallidas={}, reintentos={}",
        run.total_tasks, run.completed_tasks, run.failed_tasks, run.retries
    );
    println!("  submitted_at: {}", run.submitted_at);
    if let Some(ref started) = run.started_at {
        println!("  iniciado: {}", started);
    }
    if let Some(ref done) = run.finished_at {
        println!("  finalizado: {}", done);
    }
    for t in &run.tasks {
        print!("    {:<24} {:<16} intento={}", t.node_id, format!("{:?}", t.state), t.attempt);
        match &t.last_error {
            Some(err) => println!("  error: {}", err),
            None => println!(),
        }
    }
}

fn print_worker(w: &WorkerMetrics) {
    println!("Worker {}", w.worker_id);
    println!("  host           : {}", w.hostname);
    println!("  dead           : {}", w.dead);
    println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
    println!("  concurrency    : {}/{}", w.active_tasks, w.max_concurrency);
    println!(
        "  tareas         : started={}, ok={}, failed={}",
        w.tasks_started, w.tasks_succeeded, w.tasks_failed
    );
    match w.avg_task_ms {
        Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
        None => println!("  avg_task_ms    : (sin datos)"),
    }
    match w.last_cpu_percent {
        Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
        None => println!("  cpu_percent    : (sin datos)"),
    }
    match w.last_mem_bytes {
        Some(mem) => println!("  mem_bytes      : {}", mem),
        None => println!("  mem_bytes      : (sin datos)"),
    }
    println!();
}
