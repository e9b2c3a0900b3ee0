use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

use crate::{
    artifacts::{
        self, ArtifactsFetcherFactory, BuildApi, BuildApiFactory, CombinedArtifactsFetcher,
        ExtraCvdOptions, BOOTLOADER_IMAGE, INITRAMFS_IMAGE, KERNEL_IMAGE,
    },
    cvd::{CvdCommandError, CvdCommandOpts, CvdRunner, ExecContext, Instance},
    operation::{Operation, OperationManager, OperationResult},
    types::{
        AndroidBuild, AndroidCiBuild, AndroidCiBuildSource, ApiError, CreateCvdRequest,
        CreateCvdResponse, ListCvdsResponse, MultiError, UserBuildSource,
    },
};

mod tools;

pub use tools::CvdToolsDownloader;

pub const MAIN_BUILD_DEFAULT_BRANCH: &str = "aosp-main";
pub const MAIN_BUILD_DEFAULT_TARGET: &str = "aosp_cf_x86_64_phone-userdebug";

const ERR_MSG_LAUNCH_CVD_FAILED: &str = "failed to launch cvd";

/// Upper bound on the instances a single `create_cvd` may start.
pub const MAX_INSTANCES_PER_REQUEST: u32 = 32;

// `cvd start` flags.
const GROUP_NAME_ARG: &str = "--group_name=cvd";
const DAEMON_ARG: &str = "--daemon";
const REPORT_ANONYMOUS_USAGE_STATS_ARG: &str = "--report_anonymous_usage_stats=y";

// `assemble_cvd` resizes these, so the cvd user needs write access.
const VBMETA_IMAGES: [&str; 4] = [
    "vbmeta.img",
    "vbmeta_system.img",
    "vbmeta_vendor_dlkm.img",
    "vbmeta_system_dlkm.img",
];

/// Directory layout under the orchestrator data directory.
#[derive(Clone, Debug)]
pub struct Paths {
    pub root_dir: PathBuf,
    pub cvd_tools_dir: PathBuf,
    pub artifacts_root_dir: PathBuf,
    pub runtimes_root_dir: PathBuf,
    pub user_artifacts_root_dir: PathBuf,
}

impl Paths {
    pub fn from_root(root_dir: &Path) -> Self {
        Paths {
            root_dir: root_dir.to_path_buf(),
            cvd_tools_dir: root_dir.join("cvd_tools"),
            artifacts_root_dir: root_dir.join("artifacts"),
            runtimes_root_dir: root_dir.join("runtimes"),
            user_artifacts_root_dir: root_dir.join("user_artifacts"),
        }
    }

    pub fn cvd_bin(&self) -> PathBuf {
        self.cvd_tools_dir.join("cvd")
    }

    pub fn fetch_cvd_bin(&self) -> PathBuf {
        self.cvd_tools_dir.join("fetch_cvd")
    }
}

/// Checks whether the host is able to run devices at all.
pub trait Validator: Send + Sync {
    fn validate(&self) -> Result<(), ApiError>;
}

pub struct HostValidator;

impl Validator for HostValidator {
    fn validate(&self) -> Result<(), ApiError> {
        if !Path::new("/dev/kvm").exists() {
            return Err(ApiError::precondition(
                "Nested virtualization is not enabled.",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("field {0} is empty")]
    EmptyField(&'static str),
    #[error("exactly one of BuildSource.AndroidCiBuildSource and BuildSource.UserBuildSource must be set")]
    AmbiguousBuildSource,
    #[error("BuildSource.UserBuildSource.ArtifactsDir must be a relative path inside the user artifacts directory: {0:?}")]
    InvalidArtifactsDir(String),
    #[error("AdditionalInstancesNum must be below {MAX_INSTANCES_PER_REQUEST}: {0}")]
    InvalidInstancesCount(u32),
}

pub fn validate_request(req: &CreateCvdRequest) -> Result<(), RequestError> {
    let Some(cvd) = &req.cvd else {
        return Err(RequestError::EmptyField("Cvd"));
    };
    let Some(source) = &cvd.build_source else {
        return Err(RequestError::EmptyField("BuildSource"));
    };
    if req.additional_instances_num >= MAX_INSTANCES_PER_REQUEST {
        return Err(RequestError::InvalidInstancesCount(req.additional_instances_num));
    }

    match (&source.android_ci_build_source, &source.user_build_source) {
        (None, None) => Err(RequestError::EmptyField("BuildSource")),
        (Some(_), Some(_)) => Err(RequestError::AmbiguousBuildSource),
        (Some(_), None) => Ok(()),
        (None, Some(user)) => {
            if user.artifacts_dir.is_empty() {
                return Err(RequestError::EmptyField(
                    "BuildSource.UserBuildSource.ArtifactsDir",
                ));
            }
            let dir = Path::new(&user.artifacts_dir);
            if dir.is_absolute() || dir.components().any(|c| c == Component::ParentDir) {
                return Err(RequestError::InvalidArtifactsDir(user.artifacts_dir.clone()));
            }
            Ok(())
        }
    }
}

/// Launch failures, classified into the error stored in the operation.
#[derive(Debug, Error)]
enum LaunchError {
    #[error(transparent)]
    Command(#[from] CvdCommandError),
    #[error(transparent)]
    Fetch(#[from] MultiError),
    #[error("runtime directory {0:?} already exists")]
    RuntimeDirExists(PathBuf),
    #[error("{0:#}")]
    Other(eyre::Report),
}

impl From<eyre::Report> for LaunchError {
    fn from(err: eyre::Report) -> Self {
        LaunchError::Other(err)
    }
}

impl From<LaunchError> for ApiError {
    fn from(err: LaunchError) -> Self {
        match err {
            // Stderr goes into the details; it was logged by the runner already.
            LaunchError::Command(err @ CvdCommandError::Exec { .. }) => {
                ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED)
                    .with_details(err.to_string())
                    .with_cause(err.summary())
            }
            LaunchError::Command(err @ CvdCommandError::Timeout { .. }) => {
                ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED)
                    .with_details(err.to_string())
                    .with_cause(&err)
            }
            LaunchError::RuntimeDirExists(_) => ApiError::conflict(err.to_string()),
            err => ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED).with_cause(&err),
        }
    }
}

pub struct InstanceManagerOpts {
    pub exec: ExecContext,
    pub cvd_user: String,
    pub cvd_tools_build: AndroidBuild,
    pub paths: Paths,
    pub operations: Arc<OperationManager<CreateCvdResponse>>,
    pub build_api_factory: BuildApiFactory,
    pub fetcher_factory: ArtifactsFetcherFactory,
    pub host_validator: Arc<dyn Validator>,
    pub cvd_start_timeout: Duration,
}

/// Fetcher factory backed by `fetch_cvd` and the Build API.
pub fn default_fetcher_factory(
    exec: ExecContext,
    fetch_cvd_bin: &Path,
    build_api_factory: BuildApiFactory,
    fetch_timeout: Duration,
) -> ArtifactsFetcherFactory {
    let fetch_cvd_bin = fetch_cvd_bin.to_path_buf();
    Arc::new(move |credentials: &str| {
        Arc::new(
            CombinedArtifactsFetcher::new(
                exec.clone(),
                &fetch_cvd_bin,
                build_api_factory(credentials),
                fetch_timeout,
            )
            .with_credentials(credentials),
        ) as Arc<dyn artifacts::ArtifactsFetcher>
    })
}

struct StartParams<'a> {
    instance_numbers: &'a [u32],
    main_artifacts_dir: &'a Path,
    kernel_dir: Option<&'a Path>,
    bootloader_dir: Option<&'a Path>,
}

/// Turns create requests into running devices by driving the `cvd` tool.
pub struct InstanceManager {
    paths: Paths,
    runner: CvdRunner,
    operations: Arc<OperationManager<CreateCvdResponse>>,
    artifacts: artifacts::Manager,
    build_api_factory: BuildApiFactory,
    fetcher_factory: ArtifactsFetcherFactory,
    tools: CvdToolsDownloader,
    host_validator: Arc<dyn Validator>,
    cvd_start_timeout: Duration,
    instance_counter: AtomicU32,
}

impl InstanceManager {
    pub fn new(opts: InstanceManagerOpts) -> Self {
        // The tools don't need credentials.
        let tools_build_api: Arc<dyn BuildApi> = (opts.build_api_factory)("");
        InstanceManager {
            runner: CvdRunner::new(opts.exec, &opts.cvd_user, &opts.paths.cvd_bin()),
            tools: CvdToolsDownloader::new(
                opts.cvd_tools_build,
                &opts.paths.cvd_bin(),
                &opts.paths.fetch_cvd_bin(),
                tools_build_api,
            ),
            artifacts: artifacts::Manager::new(&opts.paths.artifacts_root_dir),
            paths: opts.paths,
            operations: opts.operations,
            build_api_factory: opts.build_api_factory,
            fetcher_factory: opts.fetcher_factory,
            host_validator: opts.host_validator,
            cvd_start_timeout: opts.cvd_start_timeout,
            instance_counter: AtomicU32::new(0),
        }
    }

    pub fn operations(&self) -> &Arc<OperationManager<CreateCvdResponse>> {
        &self.operations
    }

    /// Validates the request and prepares the host, then launches the
    /// devices in the background. The returned operation tracks the launch.
    pub async fn create_cvd(
        self: &Arc<Self>,
        req: CreateCvdRequest,
    ) -> Result<Operation<CreateCvdResponse>, ApiError> {
        validate_request(&req)
            .map_err(|err| ApiError::bad_request("invalid CreateCvdRequest").with_cause(err))?;
        self.host_validator.validate()?;

        create_dir(&self.paths.artifacts_root_dir)
            .await
            .map_err(|err| ApiError::internal("failed creating artifacts directory").with_cause(err))?;
        create_runtimes_root_dir(&self.paths.runtimes_root_dir)
            .await
            .map_err(|err| {
                ApiError::internal("failed creating cuttlefish runtime directory").with_cause(err)
            })?;
        self.tools
            .download()
            .await
            .map_err(|err| ApiError::internal("failed downloading cvd tools").with_cause(err))?;

        let op = self.operations.new_operation().await;
        tracing::info!("launching cvd; operation {}", op.name);
        tokio::spawn({
            let this = self.clone();
            let name = op.name.clone();
            async move { this.launch_cvd(req, name).await }
        });

        Ok(op)
    }

    pub async fn list_cvds(&self) -> Result<ListCvdsResponse, ApiError> {
        let fleet = self.fleet().await?;
        let instances: Vec<&Instance> = fleet.instances().iter().collect();
        Ok(ListCvdsResponse {
            cvds: fleet.to_cvds(&instances),
        })
    }

    pub async fn logs_dir(&self, name: &str) -> Result<PathBuf, ApiError> {
        let fleet = self.fleet().await?;
        match fleet.find(name) {
            Some(instance) => Ok(Path::new(&instance.instance_dir).join("logs")),
            None => Err(ApiError::not_found(format!("Instance {name:?} not found"))),
        }
    }

    async fn fleet(&self) -> Result<crate::cvd::Fleet, ApiError> {
        self.tools
            .download()
            .await
            .map_err(|err| ApiError::internal("failed downloading cvd tools").with_cause(err))?;
        self.runner
            .fleet()
            .await
            .map_err(|err| ApiError::internal("failed listing cvds").with_cause(err))
    }

    /// Runs the launch on its own task so a panic still completes `op_name`.
    async fn launch_cvd(self: Arc<Self>, req: CreateCvdRequest, op_name: String) {
        let launch = tokio::spawn({
            let this = self.clone();
            async move { this.launch_cvd_result(&req).await }
        });
        let result = launch.await.unwrap_or_else(|err| {
            tracing::error!("launch cvd task of operation {op_name} failed: {err}");
            Err(ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED).with_cause(err))
        });
        if let Err(err) = self.operations.complete(&op_name, result).await {
            tracing::error!("error completing launch cvd operation {op_name}: {err}");
        }
    }

    async fn launch_cvd_result(&self, req: &CreateCvdRequest) -> OperationResult<CreateCvdResponse> {
        let Some(instances_count) = req
            .additional_instances_num
            .checked_add(1)
            .filter(|n| *n <= MAX_INSTANCES_PER_REQUEST)
        else {
            return Err(ApiError::bad_request(format!(
                "invalid CreateCvdRequest, too many instances: {}",
                req.additional_instances_num
            )));
        };
        let source = req.build_source().cloned().unwrap_or_default();

        let launched = match (&source.android_ci_build_source, &source.user_build_source) {
            (Some(ci), _) => self.launch_from_android_ci(ci, instances_count).await,
            (None, Some(user)) => self.launch_from_user_build(user, instances_count).await,
            (None, None) => {
                return Err(ApiError::bad_request(
                    "invalid CreateCvdRequest, missing build source",
                ))
            }
        };
        let instance_numbers = launched.map_err(|err| {
            tracing::error!("failed to launch cvd: {err}");
            ApiError::from(err)
        })?;

        let fleet = self
            .runner
            .fleet()
            .await
            .map_err(|err| ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED).with_cause(err))?;
        let mut relevant = Vec::new();
        for instance in fleet.instances() {
            let number = instance
                .number()
                .map_err(|err| ApiError::internal(ERR_MSG_LAUNCH_CVD_FAILED).with_cause(err))?;
            if instance_numbers.contains(&number) {
                relevant.push(instance);
            }
        }

        Ok(CreateCvdResponse {
            cvds: fleet.to_cvds(&relevant),
        })
    }

    async fn launch_from_android_ci(
        &self,
        source: &AndroidCiBuildSource,
        instances_count: u32,
    ) -> Result<Vec<u32>, LaunchError> {
        let mut main_build = source.main_build.clone().unwrap_or_else(|| {
            AndroidCiBuild::new(MAIN_BUILD_DEFAULT_BRANCH, MAIN_BUILD_DEFAULT_TARGET)
        });
        let mut kernel_build = source.kernel_build.clone();
        let mut bootloader_build = source.bootloader_build.clone();
        let mut system_image_build = source.system_image_build.clone();

        let build_api = (self.build_api_factory)(&source.credentials);
        let (main_res, kernel_res, bootloader_res, system_image_res) = tokio::join!(
            resolve_build_id(build_api.as_ref(), Some(&mut main_build)),
            resolve_build_id(build_api.as_ref(), kernel_build.as_mut()),
            resolve_build_id(build_api.as_ref(), bootloader_build.as_mut()),
            resolve_build_id(build_api.as_ref(), system_image_build.as_mut()),
        );
        let mut merr = MultiError::default();
        for err in [main_res, kernel_res, bootloader_res, system_image_res]
            .into_iter()
            .filter_map(Result::err)
        {
            merr.push(err);
        }
        merr.into_result()?;

        let fetcher = (self.fetcher_factory)(&source.credentials);
        let extra = system_image_build.as_ref().map(|build| ExtraCvdOptions {
            system_img_build_id: build.build_id.clone(),
            system_img_target: build.target.clone(),
        });

        let main_fut = self.artifacts.get_cvd_bundle(
            &main_build.build_id,
            &main_build.target,
            extra.as_ref(),
            fetcher.as_ref(),
        );
        let kernel_fut = async {
            match &kernel_build {
                Some(build) => self
                    .artifacts
                    .get_kernel_bundle(&build.build_id, &build.target, fetcher.as_ref())
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let bootloader_fut = async {
            match &bootloader_build {
                Some(build) => self
                    .artifacts
                    .get_bootloader_bundle(&build.build_id, &build.target, fetcher.as_ref())
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };

        // Every fetch runs to completion; failures are reported together.
        let (main_dir, kernel_dir, bootloader_dir) =
            match tokio::join!(main_fut, kernel_fut, bootloader_fut) {
                (Ok(main), Ok(kernel), Ok(bootloader)) => (main, kernel, bootloader),
                (main, kernel, bootloader) => {
                    let mut merr = MultiError::default();
                    for err in [main.err(), kernel.err(), bootloader.err()]
                        .into_iter()
                        .flatten()
                    {
                        merr.push(err);
                    }
                    return Err(merr.into());
                }
            };

        let instance_numbers = self.new_instance_numbers(instances_count);
        self.start_cvd(StartParams {
            instance_numbers: &instance_numbers,
            main_artifacts_dir: &main_dir,
            kernel_dir: kernel_dir.as_deref(),
            bootloader_dir: bootloader_dir.as_deref(),
        })
        .await?;

        Ok(instance_numbers)
    }

    async fn launch_from_user_build(
        &self,
        source: &UserBuildSource,
        instances_count: u32,
    ) -> Result<Vec<u32>, LaunchError> {
        let artifacts_dir = self
            .paths
            .user_artifacts_root_dir
            .join(&source.artifacts_dir);
        set_write_permission_on_vbmeta_images(&artifacts_dir).await?;

        let instance_numbers = self.new_instance_numbers(instances_count);
        self.start_cvd(StartParams {
            instance_numbers: &instance_numbers,
            main_artifacts_dir: &artifacts_dir,
            kernel_dir: None,
            bootloader_dir: None,
        })
        .await?;

        Ok(instance_numbers)
    }

    async fn start_cvd(&self, params: StartParams<'_>) -> Result<(), LaunchError> {
        let mut home = None;
        for number in params.instance_numbers {
            let dir = self.paths.runtimes_root_dir.join(format!("cvd-{number}"));
            match create_new_dir(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(LaunchError::RuntimeDirExists(dir));
                }
                Err(err) => {
                    return Err(eyre::Report::new(err)
                        .wrap_err(format!("failed creating runtime directory {dir:?}"))
                        .into())
                }
            }
            // The group lives under the runtime directory of its first instance.
            home.get_or_insert(dir);
        }

        let mut initramfs = params.kernel_dir.map(|dir| dir.join(INITRAMFS_IMAGE));
        if let Some(path) = &initramfs {
            if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                initramfs = None;
            }
        }
        let args = start_args(&params, initramfs.as_deref());
        let opts = CvdCommandOpts {
            android_host_out: Some(params.main_artifacts_dir.to_path_buf()),
            home,
            timeout: Some(self.cvd_start_timeout),
            capture_stdout: false,
        };

        self.runner.run(&args, &opts).await?;
        Ok(())
    }

    fn new_instance_numbers(&self, n: u32) -> Vec<u32> {
        (0..n)
            .map(|_| self.instance_counter.fetch_add(1, Ordering::SeqCst) + 1)
            .collect()
    }
}

async fn resolve_build_id(
    build_api: &dyn BuildApi,
    build: Option<&mut AndroidCiBuild>,
) -> eyre::Result<()> {
    if let Some(build) = build {
        if build.build_id.is_empty() {
            build.build_id = build_api
                .get_latest_green_build_id(&build.branch, &build.target)
                .await?;
        }
    }
    Ok(())
}

fn start_args(params: &StartParams<'_>, initramfs: Option<&Path>) -> Vec<String> {
    let mut args = vec![
        GROUP_NAME_ARG.to_string(),
        "start".to_string(),
        DAEMON_ARG.to_string(),
        REPORT_ANONYMOUS_USAGE_STATS_ARG.to_string(),
    ];

    match params.instance_numbers {
        [number] => args.push(format!("--base_instance_num={number}")),
        numbers => {
            let list: Vec<String> = numbers.iter().map(|n| n.to_string()).collect();
            args.push(format!("--instance_nums={}", list.join(",")));
        }
    }
    args.push(format!(
        "--system_image_dir={}",
        params.main_artifacts_dir.display()
    ));
    if params.instance_numbers.len() > 1 {
        args.push(format!("--num_instances={}", params.instance_numbers.len()));
    }
    if let Some(dir) = params.kernel_dir {
        args.push(format!("--kernel_path={}", dir.join(KERNEL_IMAGE).display()));
        if let Some(initramfs) = initramfs {
            args.push(format!("--initramfs_path={}", initramfs.display()));
        }
    }
    if let Some(dir) = params.bootloader_dir {
        args.push(format!("--bootloader={}", dir.join(BOOTLOADER_IMAGE).display()));
    }

    args
}

// Fails if the directory already exists.
async fn create_new_dir(dir: &Path) -> io::Result<()> {
    tokio::fs::create_dir(dir).await?;
    // Regardless of umask.
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o774)).await
}

async fn create_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::create_dir_all(dir).await {
        Ok(()) => tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o774)).await,
        Err(err) => Err(err),
    }
}

// Runtime files end up owned by the directory's group (setgid).
async fn create_runtimes_root_dir(dir: &Path) -> io::Result<()> {
    create_dir(dir).await?;
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o2774)).await
}

async fn set_write_permission_on_vbmeta_images(dir: &Path) -> eyre::Result<()> {
    for name in VBMETA_IMAGES {
        let path = dir.join(name);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o664)).await?;
        }
    }
    Ok(())
}
