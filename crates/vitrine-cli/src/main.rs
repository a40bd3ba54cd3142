use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use uuid::Uuid;
use vitrine_contracts::content::{PageContent, PageType};
use vitrine_contracts::edits::{EditCategory, EditOptions, EditRegistry};
use vitrine_contracts::events::EventLog;
use vitrine_contracts::images::SlotKey;
use vitrine_contracts::product::Product;
use vitrine_contracts::session::{help_lines, parse_command, SessionCommand};
use vitrine_engine::media::extension_for_mime;
use vitrine_engine::{
    crop_image, report_json, run_edit, AuthSession, ContentService, ContentStore, CropRect,
    EditImage, EditOutcome, EditRequest, EditTransport, EditorRegistry, FormError, HttpBackend,
    ImageBucket, ImageFetcher, LocalImage, MemoryBackend, PreviewManager, ProductForm,
    ProductStore, SubmitReport, UploadReconciler, VitrineConfig,
};

#[derive(Debug, Parser)]
#[command(name = "vitrine", version, about = "Storefront product-image and content tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Crop a local image by percentages of its size.
    Crop(CropArgs),
    /// Run one AI edit on a local image.
    Edit(EditArgs),
    /// List the AI edit operations.
    Ops,
    /// Upload images onto a product and save it.
    Submit(SubmitArgs),
    /// Interactive editing session over one product.
    Session(SessionArgs),
    /// Read and publish CMS pages.
    Content(ContentArgs),
    /// Check backend configuration and connectivity.
    Health,
}

#[derive(Debug, Parser)]
struct CropArgs {
    #[arg(long)]
    input: PathBuf,
    /// x,y,width,height in percent
    #[arg(long, value_delimiter = ',', num_args = 1..)]
    rect: Vec<f64>,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Parser)]
struct EditArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    operation: String,
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    color: Option<String>,
    #[arg(long)]
    shape: Option<String>,
    #[arg(long)]
    scenario: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct SubmitArgs {
    /// Existing product id; a new product is created when omitted.
    #[arg(long)]
    product: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    description: Option<String>,
    #[arg(long)]
    price_cents: Option<i64>,
    #[arg(long)]
    category: Option<String>,
    #[arg(long = "image")]
    images: Vec<PathBuf>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
    /// Print the submit report as JSON instead of text.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long)]
    product: Option<String>,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    price_cents: Option<i64>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    dryrun: bool,
}

#[derive(Debug, Parser)]
struct ContentArgs {
    #[command(subcommand)]
    action: ContentAction,
    #[arg(long, global = true)]
    dryrun: bool,
    #[arg(long, global = true)]
    events: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum ContentAction {
    Show {
        page: PageType,
    },
    Publish {
        page: PageType,
        /// JSON file holding `{ title, description, sections }`.
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        author: Option<String>,
    },
    History {
        page: PageType,
    },
    Diff {
        page: PageType,
        from: u32,
        to: u32,
    },
    Revert {
        page: PageType,
        version: u32,
        #[arg(long)]
        author: Option<String>,
    },
}

/// Collaborators behind one invocation, live or in-memory.
struct Backends {
    bucket: Arc<dyn ImageBucket>,
    products: Arc<dyn ProductStore>,
    content: Arc<dyn ContentStore>,
    fetcher: Arc<dyn ImageFetcher>,
    auth: Option<AuthSession>,
    config: Option<VitrineConfig>,
}

impl Backends {
    fn connect(dryrun: bool) -> Result<Self> {
        if dryrun {
            let memory = Arc::new(MemoryBackend::new());
            return Ok(Self {
                bucket: memory.clone(),
                products: memory.clone(),
                content: memory.clone(),
                fetcher: memory,
                auth: AuthSession::new("dryrun"),
                config: None,
            });
        }
        let config = VitrineConfig::from_env()?;
        let http = Arc::new(HttpBackend::new(&config)?);
        Ok(Self {
            bucket: http.clone(),
            products: http.clone(),
            content: http.clone(),
            fetcher: http,
            auth: config.auth_session(),
            config: Some(config),
        })
    }

    fn parallelism(&self) -> usize {
        self.config
            .as_ref()
            .map(|config| config.upload_parallelism)
            .unwrap_or(vitrine_engine::reconcile::DEFAULT_PARALLELISM)
    }

    fn editors(&self) -> Result<EditorRegistry> {
        EditorRegistry::from_config(self.config.as_ref())
    }
}

/// Per-session artefacts under `--out`.
struct SessionDir {
    root: PathBuf,
    events: EventLog,
}

impl SessionDir {
    fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("failed creating {}", root.display()))?;
        let session_id = format!("session-{}", Uuid::new_v4().simple());
        Ok(Self {
            root: root.to_path_buf(),
            events: EventLog::new(root.join("events.jsonl"), session_id),
        })
    }

    fn previews(&self) -> Result<PreviewManager> {
        PreviewManager::new(self.root.join("previews"))
    }

    fn receipts(&self) -> PathBuf {
        self.root.join("receipts")
    }

    fn summary(&self) -> PathBuf {
        self.root.join("summary.json")
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("vitrine error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Crop(args) => run_crop(args),
        Command::Edit(args) => run_edit_command(args),
        Command::Ops => {
            print_operations(&EditRegistry::default());
            Ok(0)
        }
        Command::Submit(args) => run_submit(args),
        Command::Session(args) => run_session(args),
        Command::Content(args) => run_content(args),
        Command::Health => run_health(),
    }
}

fn run_crop(args: CropArgs) -> Result<i32> {
    let rect = parse_rect(&args.rect)?;
    let bytes =
        fs::read(&args.input).with_context(|| format!("failed reading {}", args.input.display()))?;
    let source = LocalImage::decode(bytes)?;
    let output = crop_image(&source, &rect)?;
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&args.out, &output.bytes)
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!(
        "Cropped {}x{} -> {}x{} ({})",
        source.width(),
        source.height(),
        output.width,
        output.height,
        args.out.display()
    );
    Ok(0)
}

fn run_edit_command(args: EditArgs) -> Result<i32> {
    let backends = Backends::connect(args.dryrun)?;
    let editors = backends.editors()?;
    let editor = pick_editor(&editors, args.dryrun)?;
    let registry = EditRegistry::default();

    let mut request = EditRequest::new(read_edit_image(&args.input)?, args.operation.clone());
    request.references = args
        .references
        .iter()
        .map(|path| read_edit_image(path))
        .collect::<Result<Vec<_>>>()?;
    request.prompt = args.prompt.clone();
    request.options = EditOptions {
        color: args.color.clone(),
        shape: args.shape.clone(),
        scenario: args.scenario.clone(),
    };

    fs::create_dir_all(&args.out)?;
    let run = run_edit(
        editor,
        &registry,
        &request,
        Some(args.out.join("receipts").as_path()),
        None,
    )?;
    for warning in &run.warnings {
        println!("Warning: {warning}");
    }
    if let Some(path) = run.receipt_path.as_ref() {
        println!("Receipt: {}", path.display());
    }
    match run.result {
        Ok(EditOutcome::Image { bytes, mime_type }) => {
            let path = args.out.join(format!(
                "edit-{}-{}.{}",
                request.operation,
                Uuid::new_v4().simple(),
                extension_for_mime(&mime_type)
            ));
            fs::write(&path, bytes)?;
            println!("Edited image: {}", path.display());
            Ok(0)
        }
        Ok(EditOutcome::Stored(stored)) => {
            println!("Edited image stored at {}", stored.public_url);
            Ok(0)
        }
        Err(err) => {
            eprintln!("{}", err.user_message());
            eprintln!("({err})");
            Ok(2)
        }
    }
}

fn run_submit(args: SubmitArgs) -> Result<i32> {
    let backends = Backends::connect(args.dryrun)?;
    let session = SessionDir::create(&args.out)?;
    let mut form = open_form(
        &backends,
        &session,
        args.product.as_deref(),
        args.name.clone(),
        args.price_cents,
    )?;
    if let Some(description) = args.description.clone() {
        form.fields.description = description;
    }
    if let Some(category) = args.category.clone() {
        form.fields.category = Some(category);
    }
    for path in &args.images {
        let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        match form.add_image(&display_name(path), bytes) {
            Ok(id) => println!("Added {} as {id}", path.display()),
            Err(FormError::Io(err)) => return Err(err),
            Err(err) => {
                eprintln!("{}", err.user_message());
                return Ok(2);
            }
        }
    }

    let reconciler = reconciler_for(&backends, &session);
    let code = match form.submit(backends.auth.as_ref(), &reconciler) {
        Ok(report) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                print_report(&report);
            }
            if report.failures.is_empty() {
                0
            } else {
                2
            }
        }
        Err(FormError::Io(err)) => return Err(err),
        Err(err) => {
            eprintln!("{}", err.user_message());
            2
        }
    };
    form.teardown()?;
    Ok(code)
}

fn run_session(args: SessionArgs) -> Result<i32> {
    let backends = Backends::connect(args.dryrun)?;
    let session = SessionDir::create(&args.out)?;
    let editors = backends.editors()?;
    let editor = pick_editor(&editors, args.dryrun)?;
    let reconciler = reconciler_for(&backends, &session);
    let mut form = open_form(
        &backends,
        &session,
        args.product.as_deref(),
        args.name.clone(),
        args.price_cents,
    )?;

    println!(
        "Vitrine session started ({} editor). Type /help for commands.",
        editor.name()
    );
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let command = parse_command(line.trim_end_matches(['\n', '\r']));
        let outcome = match command {
            SessionCommand::Noop => Ok(()),
            SessionCommand::Quit => break,
            SessionCommand::Help => {
                println!("Commands: {}", help_lines().join("  "));
                Ok(())
            }
            SessionCommand::List => {
                print_slots(&form);
                Ok(())
            }
            SessionCommand::Operations => {
                print_operations(form.edit_registry());
                Ok(())
            }
            SessionCommand::Add { paths } => session_add(&mut form, &paths),
            SessionCommand::Crop { slot, rect } => form.slot_at(slot).and_then(|slot| {
                let rect = CropRect::new(rect[0], rect[1], rect[2], rect[3]);
                let id = form.crop_slot(&slot, &rect, backends.fetcher.as_ref())?;
                println!("Cropped {slot} -> pending {id}");
                Ok(())
            }),
            SessionCommand::Edit {
                slot,
                operation,
                references,
            } => session_edit(
                &mut form,
                editor,
                backends.fetcher.as_ref(),
                slot,
                &operation,
                &references,
            ),
            SessionCommand::History { slot } => form.slot_at(slot).map(|slot| {
                for (idx, entry) in form.history(&slot).iter().enumerate() {
                    println!(
                        "  {idx}. {} [{}] {}",
                        entry.label,
                        entry.status.as_str(),
                        entry.preview_url
                    );
                }
            }),
            SessionCommand::Discard { slot } => form.slot_at(slot).and_then(|slot| {
                let latest = form
                    .pending()
                    .for_slot(&slot)
                    .max_by_key(|image| image.created_at)
                    .map(|image| image.id.clone());
                match latest {
                    Some(id) => {
                        form.discard_pending(&id)?;
                        println!("Discarded pending {id}");
                    }
                    None => println!("Nothing pending on {slot}"),
                }
                Ok(())
            }),
            SessionCommand::Remove { slot } => form.slot_at(slot).and_then(|slot| {
                match slot {
                    SlotKey::Existing(url) => {
                        form.remove_existing(&url)?;
                        println!("Removed {url} (saved on /submit)");
                    }
                    SlotKey::New(_) => println!("Slot is not saved yet; use /discard"),
                }
                Ok(())
            }),
            SessionCommand::Submit => form
                .submit(backends.auth.as_ref(), &reconciler)
                .map(|report| print_report(&report)),
            SessionCommand::Invalid { usage, reason } => {
                println!("{reason}. Usage: {usage}");
                Ok(())
            }
            SessionCommand::Unknown { raw } => {
                println!("Unknown command: {raw}. Type /help.");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {}
            Err(FormError::Io(err)) => return Err(err),
            Err(err) => println!("{}", err.user_message()),
        }
    }

    let released = form.teardown()?;
    println!("Session closed; released {released} previews.");
    Ok(0)
}

fn session_add(form: &mut ProductForm, paths: &[String]) -> Result<(), FormError> {
    for raw in paths {
        let path = PathBuf::from(raw);
        let bytes = fs::read(&path)
            .with_context(|| format!("failed reading {}", path.display()))
            .map_err(FormError::Io)?;
        let id = form.add_image(&display_name(&path), bytes)?;
        println!("Added {} as {id}", path.display());
    }
    Ok(())
}

fn session_edit(
    form: &mut ProductForm,
    editor: &dyn EditTransport,
    fetcher: &dyn ImageFetcher,
    slot: usize,
    operation: &str,
    references: &[String],
) -> Result<(), FormError> {
    let slot = form.slot_at(slot)?;
    let references = references
        .iter()
        .map(|raw| read_edit_image(Path::new(raw)))
        .collect::<Result<Vec<_>>>()?;
    match form.run_ai_edit(
        editor,
        fetcher,
        &slot,
        operation,
        references,
        EditOptions::default(),
    )? {
        Some(id) => println!("Edited {slot} -> pending {id}"),
        None => println!("Edit result discarded; {slot} changed while it ran."),
    }
    Ok(())
}

fn run_content(args: ContentArgs) -> Result<i32> {
    let backends = Backends::connect(args.dryrun)?;
    let events = match args.events.as_ref() {
        Some(path) => EventLog::new(path, format!("content-{}", Uuid::new_v4().simple())),
        None => EventLog::in_memory("content"),
    };
    let mut service = ContentService::new(backends.content.clone(), events);
    let auth = backends.auth.as_ref();

    match args.action {
        ContentAction::Show { page } => match service.get(page)? {
            Some(version) => {
                println!("{page} v{}", version.version);
                print!("{}", version.content.render_text());
            }
            None => println!("{page} has not been published yet."),
        },
        ContentAction::Publish { page, file, author } => {
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("failed reading {}", file.display()))?;
            let content: PageContent = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not page content JSON", file.display()))?;
            let version = service.publish(auth, page, content, author.as_deref())?;
            println!("Published {page} v{}", version.version);
        }
        ContentAction::History { page } => {
            for version in service.history(page)? {
                println!(
                    "v{} {} {}",
                    version.version,
                    version.created_at,
                    version.author.as_deref().unwrap_or("-")
                );
            }
        }
        ContentAction::Diff { page, from, to } => {
            for line in service.diff(page, from, to)? {
                println!("{line}");
            }
        }
        ContentAction::Revert {
            page,
            version,
            author,
        } => {
            let published = service.revert(auth, page, version, author.as_deref())?;
            println!("Reverted {page} to v{version} as v{}", published.version);
        }
    }
    service.teardown();
    Ok(0)
}

fn run_health() -> Result<i32> {
    let config = VitrineConfig::from_env()?;
    let backend = HttpBackend::new(&config)?;
    println!("Backend: {}", config.backend_url);
    println!(
        "Admin session: {}",
        if config.auth_session().is_some() { "yes" } else { "no" }
    );
    println!(
        "Edit proxy: {} ({})",
        config.edit_proxy_url.as_deref().unwrap_or("not configured"),
        config.edit_wire
    );
    let buckets = backend.list_buckets()?;
    if !buckets.iter().any(|name| name == &config.image_bucket) {
        println!(
            "Bucket '{}' missing (found: {})",
            config.image_bucket,
            buckets.join(", ")
        );
        return Ok(2);
    }
    println!("Bucket '{}' reachable.", config.image_bucket);
    Ok(0)
}

fn open_form(
    backends: &Backends,
    session: &SessionDir,
    product_id: Option<&str>,
    name: Option<String>,
    price_cents: Option<i64>,
) -> Result<ProductForm> {
    let previews = session.previews()?;
    let events = session.events.clone();
    let mut form = match product_id {
        Some(id) => {
            let product: Product = backends.products.get_product(id)?;
            ProductForm::for_product(product, previews, events)
        }
        None => ProductForm::new(previews, events),
    };
    if let Some(name) = name {
        form.fields.name = name;
    }
    if let Some(price_cents) = price_cents {
        form.fields.price_cents = price_cents;
    }
    Ok(form.with_receipts_dir(session.receipts()))
}

fn reconciler_for(backends: &Backends, session: &SessionDir) -> UploadReconciler {
    UploadReconciler::new(
        backends.bucket.clone(),
        backends.products.clone(),
        session.events.clone(),
    )
    .with_parallelism(backends.parallelism())
    .with_summary_path(session.summary())
}

fn pick_editor(editors: &EditorRegistry, dryrun: bool) -> Result<&dyn EditTransport> {
    let name = if dryrun { "local" } else { "proxy" };
    match editors.get(name) {
        Some(editor) => Ok(editor),
        None if !dryrun => bail!("VITRINE_EDIT_PROXY_URL is not set; use --dryrun for local edits."),
        None => bail!("No '{name}' editor registered."),
    }
}

fn read_edit_image(path: &Path) -> Result<EditImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    Ok(EditImage::new(bytes))
}

fn parse_rect(values: &[f64]) -> Result<CropRect> {
    match values {
        [x, y, width, height] => Ok(CropRect::new(*x, *y, *width, *height)),
        _ => bail!("--rect expects x,y,width,height (got {} values)", values.len()),
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

fn print_slots(form: &ProductForm) {
    let slots = form.slots();
    if slots.is_empty() {
        println!("No images yet. Use /add <path>.");
        return;
    }
    for (idx, slot) in slots.iter().enumerate() {
        let status = form
            .pending()
            .for_slot(slot)
            .max_by_key(|image| image.created_at)
            .map(|image| format!("{} {}", image.provenance.as_str(), image.status.as_str()))
            .unwrap_or_else(|| "saved".to_string());
        println!(
            "  {idx}. [{status}] {}",
            form.display_url(slot).unwrap_or_default()
        );
    }
}

fn print_operations(registry: &EditRegistry) {
    for category in [
        EditCategory::Background,
        EditCategory::Enhancement,
        EditCategory::Style,
        EditCategory::Geometry,
    ] {
        println!("{}:", category.as_str());
        for operation in registry.by_category(category) {
            let suffix = if operation.needs_reference {
                " (needs reference)"
            } else {
                ""
            };
            println!("  {:<18} {}{suffix}", operation.id, operation.label);
        }
    }
}

fn print_report(report: &SubmitReport) {
    for upload in &report.uploaded {
        match upload.replaced.as_deref() {
            Some(previous) => println!("Replaced {previous} -> {}", upload.url),
            None => println!("Uploaded {}", upload.url),
        }
    }
    for failure in &report.failures {
        println!("Failed {}: {}", failure.pending_id, failure.reason);
    }
    if let Some(summary) = report.failure_summary() {
        println!("{summary}; failed images stay pending for another /submit.");
    }
    println!(
        "Saved {} with {} images.",
        report.product_id,
        report.images.len()
    );
}
