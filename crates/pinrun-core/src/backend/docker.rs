//! [`ContainerEngine`] over the Docker API

use super::container::{ContainerEngine, ContainerSpec, ExecOutput};
use crate::errors::{PinrunError, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::container::LogOutput;
#[allow(deprecated)]
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptions as BollardCreateContainerOptionsQuery,
    CreateImageOptions as BollardCreateImageOptionsQuery,
    InspectContainerOptions as BollardInspectContainerOptionsQuery, PushImageOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions as BollardStartContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::env;

pub struct DockerEngine {
    docker: Docker,
    credentials: Option<DockerCredentials>,
}

impl DockerEngine {
    /// Connects with the local defaults (`DOCKER_HOST` or the local socket).
    /// Registry credentials come from `PINRUN_REGISTRY_USERNAME` and `PINRUN_REGISTRY_PASSWORD`.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        let credentials = match (
            env::var("PINRUN_REGISTRY_USERNAME"),
            env::var("PINRUN_REGISTRY_PASSWORD"),
        ) {
            (Ok(username), Ok(password)) => Some(DockerCredentials {
                username: Some(username),
                password: Some(password),
                ..Default::default()
            }),
            _ => None,
        };
        Ok(Self {
            docker,
            credentials,
        })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }
}

/// `registry:5000/repo:tag` -> (`registry:5000/repo`, `tag`)
pub fn split_tag(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repository, tag)) if !tag.contains('/') => (repository, tag),
        _ => (image, "latest"),
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Tar archive holding the Dockerfile and the extra files.
pub fn build_context(dockerfile: &str, files: &[(String, Vec<u8>)]) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_file(&mut builder, "Dockerfile", dockerfile.as_bytes())?;
    for (name, content) in files {
        append_file(&mut builder, name, content)?;
    }
    Ok(builder.into_inner()?)
}

fn append_file(builder: &mut tar::Builder<Vec<u8>>, name: &str, content: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    builder.append_data(&mut header, name, content)?;
    Ok(())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn pull_image(&self, tag: &str) -> Result<bool> {
        let (repository, version) = split_tag(tag);
        let options = Some(BollardCreateImageOptionsQuery {
            from_image: Some(repository.to_string()),
            tag: Some(version.to_string()),
            ..Default::default()
        });

        let mut stream = self
            .docker
            .create_image(options, None, self.credentials.clone());
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => log::debug!("Pulling {}: {:?}", tag, info.status),
                Err(e) => {
                    log::debug!("Failed to pull image {}: {}", tag, e);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn build_image(&self, tag: &str, dockerfile: &str, files: &[(String, Vec<u8>)]) -> Result<()> {
        let context = build_context(dockerfile, files)?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(tag)
            .rm(true)
            .build();

        let mut build_log = String::new();
        let mut stream = self
            .docker
            .build_image(options, None, Some(bollard::body_full(context.into())));
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(line) = info.stream {
                        build_log.push_str(&line);
                    }
                    if let Some(error) = info.error {
                        return Err(PinrunError::build(
                            format!("Building image {} failed: {}", tag, error),
                            build_log,
                        ));
                    }
                }
                Err(e) => {
                    return Err(PinrunError::build(
                        format!("Building image {} failed: {}", tag, e),
                        build_log,
                    ))
                }
            }
        }

        log::debug!("Built {}:\n{}", tag, build_log);
        Ok(())
    }

    async fn push_image(&self, tag: &str) -> Result<()> {
        let (repository, version) = split_tag(tag);
        let options = PushImageOptionsBuilder::default().tag(version).build();

        let mut push_log = String::new();
        let mut stream = self
            .docker
            .push_image(repository, Some(options), self.credentials.clone());
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        push_log.push_str(&status);
                        push_log.push('\n');
                    }
                    if let Some(error) = info.error {
                        return Err(PinrunError::build(
                            format!("Pushing {} failed: {}", tag, error),
                            push_log,
                        ));
                    }
                }
                Err(e) => {
                    return Err(PinrunError::build(
                        format!("Pushing {} failed: {}", tag, e),
                        push_log,
                    ))
                }
            }
        }
        Ok(())
    }

    async fn container_running(&self, name: &str) -> Result<bool> {
        match self
            .docker
            .inspect_container(name, None::<BollardInspectContainerOptionsQuery>)
            .await
        {
            Ok(details) => Ok(details
                .state
                .and_then(|state| state.running)
                .unwrap_or(false)),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_container(&self, spec: &ContainerSpec) -> Result<String> {
        // A stopped container with the same name would make creation fail.
        self.remove_container(&spec.name).await?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(spec.name.clone()),
            ..Default::default()
        });
        let config = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["sh".to_string()]),
            tty: Some(true),
            open_stdin: Some(true),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let container = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| PinrunError::build(format!("Failed to create container {}", spec.name), e.to_string()))?;
        self.docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await
            .map_err(|e| PinrunError::build(format!("Failed to start container {}", spec.name), e.to_string()))?;

        Ok(container.id)
    }

    #[allow(deprecated)]
    async fn exec(&self, container: &str, command: &[String], working_dir: &str) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions::<String> {
                    cmd: Some(command.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(working_dir.to_string()),
                    ..Default::default()
                },
            )
            .await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    LogOutput::StdErr { message } => stderr.push_str(&String::from_utf8_lossy(&message)),
                    _ => {}
                }
            }
        }

        let exit_code = self.docker.inspect_exec(&exec.id).await?.exit_code;
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match self.docker.remove_container(container, Some(options)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
