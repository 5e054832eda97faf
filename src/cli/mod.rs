//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "smartchat",
    version,
    about = "Retrieval-augmented question answering over a document corpus",
    long_about = "SmartChat answers questions over a document corpus: it retrieves fragments with \
                  hybrid vector and keyword search, reranks them, assembles a cited prompt and \
                  generates an answer through a fallback chain of LLM providers, with streaming \
                  and a query cache."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/smartchat/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Profile to apply on top of the config file
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the query server in the foreground
    Serve {
        /// Socket path (overrides server.socket_path)
        #[arg(short, long)]
        socket: Option<PathBuf>,

        /// Corpus file to load (overrides corpus.path)
        #[arg(long)]
        corpus: Option<PathBuf>,
    },

    /// Ask a question through the running server
    Ask {
        /// Question to ask
        question: String,

        /// Print the answer as it is generated
        #[arg(long)]
        stream: bool,

        /// Restrict retrieval to one document
        #[arg(short, long)]
        document: Option<u64>,

        /// Provider to try first
        #[arg(long)]
        provider: Option<String>,

        /// Show the result in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show the fragments hybrid retrieval finds, with their scores
    Search {
        /// Search text
        query: String,

        /// Restrict retrieval to one document
        #[arg(short, long)]
        document: Option<u64>,

        /// Maximum number of results (defaults to retrieval.final_k)
        #[arg(short, long)]
        limit: Option<usize>,

        /// Show the results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Show provider availability
    Providers {
        /// Re-probe every provider before reporting
        #[arg(short, long)]
        refresh: bool,
    },

    /// Inspect or clear the query cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Drop cached entries for a document
    Invalidate {
        document_id: u64,

        /// The document was deleted rather than updated
        #[arg(long)]
        deleted: bool,
    },

    /// Check server health
    Health,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show hit/miss counters and key counts
    Stats,

    /// Remove cached entries
    Clear {
        /// Namespace to clear: retrieval, response, docmeta or all
        #[arg(short, long, value_parser = ["retrieval", "response", "docmeta", "all"], conflicts_with_all = ["document", "pattern"])]
        scope: Option<String>,

        /// Clear every entry of one document
        #[arg(short, long, conflicts_with = "pattern")]
        document: Option<u64>,

        /// Clear keys matching a glob pattern
        #[arg(long)]
        pattern: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_streamed_ask() {
        let cli = Cli::try_parse_from([
            "smartchat",
            "ask",
            "What is the refund policy?",
            "--stream",
            "--document",
            "42",
        ])
        .unwrap();

        match cli.command {
            Commands::Ask {
                question,
                stream,
                document,
                provider,
                ..
            } => {
                assert_eq!(question, "What is the refund policy?");
                assert!(stream);
                assert_eq!(document, Some(42));
                assert!(provider.is_none());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_search() {
        let cli =
            Cli::try_parse_from(["smartchat", "search", "refund window", "-d", "42", "-l", "3"])
                .unwrap();

        match cli.command {
            Commands::Search {
                query,
                document,
                limit,
                json,
            } => {
                assert_eq!(query, "refund window");
                assert_eq!(document, Some(42));
                assert_eq!(limit, Some(3));
                assert!(!json);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cache_clear_targets_conflict() {
        let result = Cli::try_parse_from([
            "smartchat",
            "cache",
            "clear",
            "--scope",
            "response",
            "--document",
            "7",
        ]);
        assert!(result.is_err());
    }
}
