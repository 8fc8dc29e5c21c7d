//! Incoming message routing.
//!
//! Decides, for each accepted chat message: which adapter runs, what prompt
//! it gets, whether it resumes an existing thread, and under which
//! project/branch context. Precedence: resume line > reply `ctx:` footer >
//! leading directives > configured defaults.

use std::sync::Arc;

use thiserror::Error;

use crate::config::Config;
use crate::model::{EngineId, ResumeToken};
use crate::runner::Runner;
use crate::runners::RunnerRegistry;
use crate::workspace;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunContext {
    pub project: Option<String>,
    pub branch: Option<String>,
}

impl RunContext {
    pub fn is_empty(&self) -> bool {
        self.project.is_none() && self.branch.is_none()
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("multiple engine directives")]
    DuplicateEngine,

    #[error("multiple project directives")]
    DuplicateProject,

    #[error("multiple @branch directives")]
    DuplicateBranch,

    #[error("unknown project {0:?} in ctx line")]
    UnknownCtxProject(String),

    #[error(transparent)]
    Workspace(#[from] workspace::WorkspaceError),
}

/// A routed unit of work, ready for the scheduler.
pub struct Job {
    pub runner: Arc<dyn Runner>,
    pub prompt: String,
    pub resume: Option<ResumeToken>,
    pub context: RunContext,
}

#[derive(Debug, PartialEq, Eq)]
struct ParsedDirectives {
    prompt: String,
    engine: Option<EngineId>,
    project: Option<String>,
    branch: Option<String>,
}

pub struct Router {
    registry: Arc<RunnerRegistry>,
    config: Arc<Config>,
}

impl Router {
    pub fn new(registry: Arc<RunnerRegistry>, config: Arc<Config>) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    /// Directive scan over the first non-empty line: leading `/engine`,
    /// `/project`, and `@branch` tokens are consumed until the first token
    /// that is none of those. Duplicates of a recognized directive are
    /// errors; an unrecognized `/name` simply ends the scan and stays in the
    /// prompt.
    fn parse_directives(&self, text: &str) -> Result<ParsedDirectives, RouteError> {
        let mut parsed = ParsedDirectives {
            prompt: text.trim().to_string(),
            engine: None,
            project: None,
            branch: None,
        };
        if text.is_empty() {
            return Ok(parsed);
        }

        let mut lines: Vec<&str> = text.split('\n').collect();
        let Some(idx) = lines.iter().position(|line| !line.trim().is_empty()) else {
            return Ok(parsed);
        };

        let engine_ids = self.registry.engine_ids();
        let tokens: Vec<&str> = lines[idx].split_whitespace().collect();
        let mut consumed = 0;

        for token in &tokens {
            if let Some(name) = token.strip_prefix('/') {
                let name = name.split('@').next().unwrap_or(name);
                if name.is_empty() {
                    break;
                }
                let lower = name.to_ascii_lowercase();
                if let Some(engine) = engine_ids.iter().find(|id| id.as_str() == lower) {
                    if parsed.engine.is_some() {
                        return Err(RouteError::DuplicateEngine);
                    }
                    parsed.engine = Some(engine.clone());
                    consumed += 1;
                    continue;
                }
                if self.config.projects.contains_key(&lower) {
                    if parsed.project.is_some() {
                        return Err(RouteError::DuplicateProject);
                    }
                    parsed.project = Some(lower);
                    consumed += 1;
                    continue;
                }
                break;
            }
            if let Some(branch) = token.strip_prefix('@') {
                if branch.is_empty() {
                    break;
                }
                if parsed.branch.is_some() {
                    return Err(RouteError::DuplicateBranch);
                }
                workspace::validate_branch(branch)?;
                parsed.branch = Some(branch.to_string());
                consumed += 1;
                continue;
            }
            break;
        }

        if consumed == 0 {
            return Ok(parsed);
        }

        let remainder = tokens[consumed..].join(" ");
        if remainder.is_empty() {
            lines.remove(idx);
        } else {
            lines[idx] = &remainder;
            parsed.prompt = lines.join("\n").trim().to_string();
            return Ok(parsed);
        }
        parsed.prompt = lines.join("\n").trim().to_string();
        Ok(parsed)
    }

    /// Parse a bot-message `ctx: project [@ branch]` footer (last one wins).
    fn parse_ctx_line(&self, text: Option<&str>) -> Result<Option<RunContext>, RouteError> {
        let Some(text) = text else {
            return Ok(None);
        };
        let mut ctx = None;
        for line in text.lines() {
            let stripped = line.trim().trim_matches('`').trim();
            let Some(content) = stripped
                .strip_prefix("ctx:")
                .or_else(|| stripped.strip_prefix("Ctx:"))
                .or_else(|| stripped.strip_prefix("CTX:"))
            else {
                continue;
            };
            let tokens: Vec<&str> = content.split_whitespace().collect();
            let Some(project) = tokens.first() else {
                continue;
            };
            let branch = match tokens.get(1) {
                Some(&"@") => tokens.get(2).map(|b| b.to_string()),
                Some(token) => token.strip_prefix('@').map(String::from),
                None => None,
            };
            let project_key = project.to_ascii_lowercase();
            if !self.config.projects.contains_key(&project_key) {
                return Err(RouteError::UnknownCtxProject(project.to_string()));
            }
            ctx = Some(RunContext {
                project: Some(project_key),
                branch,
            });
        }
        Ok(ctx)
    }

    pub fn resolve(&self, text: &str, reply_text: Option<&str>) -> Result<Job, RouteError> {
        let directives = self.parse_directives(text)?;
        let reply_ctx = self.parse_ctx_line(reply_text)?;

        // A resume line fixes the adapter; any /engine directive is ignored.
        let resume = self
            .registry
            .resolve_resume(&directives.prompt)
            .or_else(|| reply_text.and_then(|reply| self.registry.resolve_resume(reply)));
        if let Some((runner, token)) = resume {
            return Ok(Job {
                runner,
                prompt: directives.prompt,
                resume: Some(token),
                context: reply_ctx.unwrap_or_default(),
            });
        }

        // A reply ctx footer adopts that project/branch and overrides the
        // text's directives.
        if let Some(ctx) = reply_ctx {
            let engine = ctx
                .project
                .as_ref()
                .and_then(|p| self.config.projects.get(p))
                .and_then(|p| p.default_engine.as_deref())
                .map(EngineId::from);
            let runner = engine
                .and_then(|id| self.registry.get(&id))
                .unwrap_or_else(|| self.registry.default_runner());
            return Ok(Job {
                runner,
                prompt: directives.prompt,
                resume: None,
                context: ctx,
            });
        }

        let project = directives
            .project
            .or_else(|| self.config.default_project.clone());
        let context = RunContext {
            project: project.clone(),
            branch: directives.branch,
        };

        let engine = directives.engine.or_else(|| {
            project
                .as_ref()
                .and_then(|p| self.config.projects.get(p))
                .and_then(|p| p.default_engine.as_deref())
                .map(EngineId::from)
        });
        let runner = engine
            .and_then(|id| self.registry.get(&id))
            .unwrap_or_else(|| self.registry.default_runner());

        Ok(Job {
            runner,
            prompt: directives.prompt,
            resume: None,
            context,
        })
    }
}

/// Format the inline-code context footer echoed on bot messages.
pub fn format_context_line(context: &RunContext) -> Option<String> {
    let project = context.project.as_ref()?;
    Some(match &context.branch {
        Some(branch) => format!("`ctx: {project} @ {branch}`"),
        None => format!("`ctx: {project}`"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use std::path::PathBuf;

    fn router() -> Router {
        let mut config = Config::default();
        config.projects.insert(
            "api".into(),
            ProjectConfig {
                path: PathBuf::from("/code/api"),
                worktrees_dir: Some(PathBuf::from("/code/api-wt")),
                default_engine: Some("claude".into()),
                worktree_base: None,
                chat_id: None,
            },
        );
        let registry = Arc::new(RunnerRegistry::build(&config, None).unwrap());
        Router::new(registry, Arc::new(config))
    }

    #[test]
    fn plain_message_uses_default_engine() {
        let router = router();
        let job = router.resolve("refactor this", None).unwrap();
        assert_eq!(job.runner.engine().as_str(), "codex");
        assert_eq!(job.prompt, "refactor this");
        assert!(job.resume.is_none());
        assert!(job.context.is_empty());
    }

    #[test]
    fn engine_directive_is_stripped() {
        let router = router();
        let job = router.resolve("/claude fix the tests", None).unwrap();
        assert_eq!(job.runner.engine().as_str(), "claude");
        assert_eq!(job.prompt, "fix the tests");
    }

    #[test]
    fn project_and_branch_directives_set_context() {
        let router = router();
        let job = router.resolve("/api @feature/login do it", None).unwrap();
        assert_eq!(job.context.project.as_deref(), Some("api"));
        assert_eq!(job.context.branch.as_deref(), Some("feature/login"));
        assert_eq!(job.prompt, "do it");
        // Project default engine applies when no /engine directive is given.
        assert_eq!(job.runner.engine().as_str(), "claude");
    }

    #[test]
    fn duplicate_directives_are_errors() {
        let router = router();
        assert!(matches!(
            router.resolve("/codex /claude hi", None),
            Err(RouteError::DuplicateEngine)
        ));
        assert!(matches!(
            router.resolve("@a @b hi", None),
            Err(RouteError::DuplicateBranch)
        ));
    }

    #[test]
    fn illegal_branch_is_an_error() {
        let router = router();
        assert!(router.resolve("@../escape hi", None).is_err());
        assert!(router.resolve("@/abs hi", None).is_err());
    }

    #[test]
    fn unknown_slash_token_stays_in_prompt() {
        let router = router();
        let job = router.resolve("/unknown thing", None).unwrap();
        assert_eq!(job.prompt, "/unknown thing");
        assert_eq!(job.runner.engine().as_str(), "codex");
    }

    #[test]
    fn resume_in_reply_overrides_engine_directive() {
        let router = router();
        let job = router
            .resolve("/claude refresh", Some("earlier answer\n`codex resume U`"))
            .unwrap();
        assert_eq!(job.runner.engine().as_str(), "codex");
        let token = job.resume.unwrap();
        assert_eq!(token.value, "U");
        // The /claude directive was consumed, not folded back into the prompt.
        assert_eq!(job.prompt, "refresh");
    }

    #[test]
    fn resume_in_text_wins_over_reply() {
        let router = router();
        let job = router
            .resolve(
                "continue\n`claude --resume A`",
                Some("`codex resume B`"),
            )
            .unwrap();
        assert_eq!(job.runner.engine().as_str(), "claude");
        assert_eq!(job.resume.unwrap().value, "A");
    }

    #[test]
    fn reply_ctx_footer_overrides_text_directives() {
        let router = router();
        let job = router
            .resolve("@other do more", Some("done\n`ctx: api @ main`"))
            .unwrap();
        assert_eq!(job.context.project.as_deref(), Some("api"));
        assert_eq!(job.context.branch.as_deref(), Some("main"));
        // Project default engine from the adopted ctx.
        assert_eq!(job.runner.engine().as_str(), "claude");
    }

    #[test]
    fn unknown_ctx_project_is_an_error() {
        let router = router();
        assert!(matches!(
            router.resolve("hi", Some("`ctx: ghost`")),
            Err(RouteError::UnknownCtxProject(_))
        ));
    }

    #[test]
    fn stripped_prompt_parses_clean_on_second_pass() {
        let router = router();
        let job = router.resolve("/claude /api @main do it", None).unwrap();
        let again = router.resolve(&job.prompt, None).unwrap();
        assert_eq!(again.prompt, job.prompt);
        assert!(again.context.is_empty() || again.context.project.is_none());
    }

    #[test]
    fn context_line_round_trip() {
        let context = RunContext {
            project: Some("api".into()),
            branch: Some("main".into()),
        };
        assert_eq!(
            format_context_line(&context).as_deref(),
            Some("`ctx: api @ main`")
        );
        assert_eq!(format_context_line(&RunContext::default()), None);
    }
}
