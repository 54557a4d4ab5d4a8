//! Tests for the conduit-cli library module.

use super::*;
use conduit_runtime::environment::{AWS_ACCESS_KEY_ID, LOCAL_STORAGE_PATH};
use tempfile::TempDir;

async fn local_provider(dir: &TempDir) -> Provider {
    let env = Environment::from_pairs([(LOCAL_STORAGE_PATH, dir.path().to_str().unwrap())]);
    create_provider(ProviderType::Local, &env).await.unwrap()
}

async fn run(command: Commands, provider: &Provider) -> Result<String, CliError> {
    let mut out = Vec::new();
    execute_operation(command, provider, &mut out).await?;
    Ok(String::from_utf8(out).unwrap())
}

mod parsing {
    use super::*;

    /// Verify global flags and the send command.
    #[test]
    fn test_send_parsing() {
        let cli = Cli::try_parse_from([
            "conduit",
            "--provider",
            "aws",
            "--json-logs",
            "send",
            "--queue",
            "jobs",
            "--body",
            r#"{"n":1}"#,
            "--priority",
            "high",
            "--attr",
            "tenant=acme",
        ])
        .unwrap();

        assert_eq!(cli.provider, Some(ProviderType::Aws));
        assert!(cli.json_logs);
        assert_eq!(cli.log_level, "info");
        match cli.command {
            Commands::Send {
                queue,
                priority,
                attributes,
                delay,
                ..
            } => {
                assert_eq!(queue, "jobs");
                assert_eq!(priority, Some(Priority::High));
                assert_eq!(attributes, vec![("tenant".to_string(), "acme".to_string())]);
                assert_eq!(delay, None);
            }
            other => panic!("Expected Send command, got {:?}", other),
        }
    }

    /// Verify that provider aliases are accepted.
    #[test]
    fn test_provider_alias() {
        let cli = Cli::try_parse_from(["conduit", "-p", "pubsub", "check"]).unwrap();
        assert_eq!(cli.provider, Some(ProviderType::Gcp));
    }

    /// Verify that an unknown provider is rejected by the parser.
    #[test]
    fn test_unknown_provider_rejected() {
        assert!(Cli::try_parse_from(["conduit", "--provider", "azure", "check"]).is_err());
    }

    /// Verify receive defaults.
    #[test]
    fn test_receive_defaults() {
        let cli = Cli::try_parse_from(["conduit", "receive", "-q", "jobs"]).unwrap();
        match cli.command {
            Commands::Receive {
                max,
                wait,
                visibility,
                ack,
                ..
            } => {
                assert_eq!(max, 1);
                assert_eq!(wait, 0);
                assert_eq!(visibility, None);
                assert!(!ack);
            }
            other => panic!("Expected Receive command, got {:?}", other),
        }
    }

    /// Verify that malformed metadata is rejected.
    #[test]
    fn test_bad_metadata_rejected() {
        let result = Cli::try_parse_from([
            "conduit", "upload", "-b", "b", "-k", "k", "-f", "file", "--meta", "novalue",
        ]);
        assert!(result.is_err());
    }

    /// Verify key=value splitting.
    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_key_value("a=").unwrap(), ("a".to_string(), String::new()));
        assert!(parse_key_value("=b").is_err());
    }
}

mod errors {
    use super::*;

    /// Verify the exit code of each error class.
    #[test]
    fn test_exit_codes() {
        let config = CliError::Configuration(ConfigError::FileNotFound {
            path: PathBuf::from("x"),
        });
        let queue = CliError::Queue(QueueError::ShuttingDown);
        let storage = CliError::Storage(StorageError::NotFound {
            bucket: "b".to_string(),
            key: "k".to_string(),
        });
        let arg = CliError::InvalidArgument {
            arg: "--body".to_string(),
            message: "bad".to_string(),
        };
        let io = CliError::Io(std::io::Error::other("disk"));

        assert_eq!(config.exit_code(), 1);
        assert_eq!(queue.exit_code(), 2);
        assert_eq!(storage.exit_code(), 3);
        assert_eq!(arg.exit_code(), 4);
        assert_eq!(io.exit_code(), 5);
    }
}

mod configuration {
    use super::*;

    /// Verify that a YAML file feeds provider and environment overlays.
    #[test]
    fn test_load_yaml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conduit.yaml");
        std::fs::write(
            &path,
            "provider: local\noutput: json\nenvironment:\n  LOCAL_STORAGE_PATH: /srv/data\n",
        )
        .unwrap();

        let config = load_configuration(Some(&path)).unwrap();
        assert_eq!(config.provider.as_deref(), Some("local"));
        assert_eq!(config.output, OutputFormat::Json);

        let env = resolve_environment(Environment::default(), None, &config).unwrap();
        assert_eq!(env.get(LOCAL_STORAGE_PATH), Some("/srv/data"));
        assert_eq!(env.get(CLOUD_PROVIDER), Some("local"));
    }

    /// Verify that a missing explicit file is reported.
    #[test]
    fn test_missing_file() {
        let result = load_configuration(Some(Path::new("/nonexistent/conduit.toml")));
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    /// Verify that the provider flag wins over the config file.
    #[test]
    fn test_flag_overrides_config() {
        let config = CliConfig {
            provider: Some("gcp".to_string()),
            ..CliConfig::default()
        };

        let env =
            resolve_environment(Environment::default(), Some(ProviderType::Aws), &config).unwrap();
        assert_eq!(env.provider_type().unwrap(), ProviderType::Aws);
    }

    /// Verify that an unknown provider in the config file is an error.
    #[test]
    fn test_unknown_config_provider() {
        let config = CliConfig {
            provider: Some("azure".to_string()),
            ..CliConfig::default()
        };

        assert!(matches!(
            resolve_environment(Environment::default(), None, &config),
            Err(ConfigError::Runtime(ConfigurationError::UnknownProvider { .. }))
        ));
    }
}

mod commands {
    use super::*;

    /// Verify the text report of check.
    #[tokio::test]
    async fn test_check_text() {
        let env = Environment::from_pairs([(CLOUD_PROVIDER, "local")]);
        let mut out = Vec::new();

        execute_command(
            Commands::Check {
                format: OutputFormat::Text,
            },
            &env,
            &CliConfig::default(),
            &mut out,
        )
        .await
        .unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("provider: local"));
        assert!(text.contains("LOCAL_STORAGE_PATH = ./data/storage"));
        assert!(text.ends_with("ok\n"));
    }

    /// Verify that check fails on partial credentials.
    #[tokio::test]
    async fn test_check_partial_credentials() {
        let env = Environment::from_pairs([(CLOUD_PROVIDER, "aws"), (AWS_ACCESS_KEY_ID, "AKIA")]);
        let mut out = Vec::new();

        let err = execute_command(
            Commands::Check {
                format: OutputFormat::Json,
            },
            &env,
            &CliConfig::default(),
            &mut out,
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 1);
        assert!(out.is_empty());
    }

    /// Verify send then receive with ack prints the message once.
    #[tokio::test]
    async fn test_send_receive_ack() {
        let dir = TempDir::new().unwrap();
        let provider = local_provider(&dir).await;

        let id = run(
            Commands::Send {
                queue: "jobs".to_string(),
                body: r#"{"order":7}"#.to_string(),
                delay: None,
                priority: None,
                group_id: None,
                dedup_id: None,
                attributes: vec![("tenant".to_string(), "acme".to_string())],
            },
            &provider,
        )
        .await
        .unwrap();

        let receive = || Commands::Receive {
            queue: "jobs".to_string(),
            max: 5,
            wait: 0,
            visibility: None,
            ack: true,
        };
        let printed = run(receive(), &provider).await.unwrap();
        let message: serde_json::Value = serde_json::from_str(printed.trim()).unwrap();
        assert_eq!(message["id"], id.trim());
        assert_eq!(message["body"]["order"], 7);
        assert_eq!(message["attributes"]["tenant"], "acme");

        assert_eq!(run(receive(), &provider).await.unwrap(), "");
    }

    /// Verify that a non-JSON body is an invalid argument.
    #[tokio::test]
    async fn test_send_invalid_body() {
        let dir = TempDir::new().unwrap();
        let provider = local_provider(&dir).await;

        let err = run(
            Commands::Send {
                queue: "jobs".to_string(),
                body: "{not json".to_string(),
                delay: None,
                priority: None,
                group_id: None,
                dedup_id: None,
                attributes: Vec::new(),
            },
            &provider,
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 4);
    }

    /// Verify the upload, download, exists and delete cycle.
    #[tokio::test]
    async fn test_storage_cycle() {
        let dir = TempDir::new().unwrap();
        let provider = local_provider(&dir).await;
        let source = dir.path().join("input.txt");
        std::fs::write(&source, "payload").unwrap();
        let exists = || Commands::Exists {
            bucket: "files".to_string(),
            key: "a/b.txt".to_string(),
        };

        assert_eq!(run(exists(), &provider).await.unwrap(), "false\n");

        let uri = run(
            Commands::Upload {
                bucket: "files".to_string(),
                key: "a/b.txt".to_string(),
                file: source,
                content_type: Some("text/plain".to_string()),
                metadata: vec![("owner".to_string(), "ops".to_string())],
            },
            &provider,
        )
        .await
        .unwrap();
        assert!(uri.starts_with("file://"));
        assert_eq!(run(exists(), &provider).await.unwrap(), "true\n");

        let downloaded = run(
            Commands::Download {
                bucket: "files".to_string(),
                key: "a/b.txt".to_string(),
                output: None,
            },
            &provider,
        )
        .await
        .unwrap();
        assert_eq!(downloaded, "payload");

        let signed = run(
            Commands::Sign {
                bucket: "files".to_string(),
                key: "a/b.txt".to_string(),
                expires: 60,
                write: false,
            },
            &provider,
        )
        .await
        .unwrap();
        assert!(signed.contains("action=read"));

        run(
            Commands::Delete {
                bucket: "files".to_string(),
                key: "a/b.txt".to_string(),
            },
            &provider,
        )
        .await
        .unwrap();
        assert_eq!(run(exists(), &provider).await.unwrap(), "false\n");
    }

    /// Verify that downloading a missing object maps to the storage exit code.
    #[tokio::test]
    async fn test_download_missing() {
        let dir = TempDir::new().unwrap();
        let provider = local_provider(&dir).await;

        let err = run(
            Commands::Download {
                bucket: "files".to_string(),
                key: "missing".to_string(),
                output: None,
            },
            &provider,
        )
        .await
        .unwrap_err();

        assert_eq!(err.exit_code(), 3);
    }
}
