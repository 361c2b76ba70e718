//! Role definitions sent at the start of a fresh worker session.

use crate::crew_config::ModelTier;
use crate::tasks::Role;

/// A specialist the orchestrator can route tasks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleProfile {
    pub name: &'static str,
    pub title: &'static str,
    pub preamble: &'static str,
    /// Model tier when routing is enabled and the config has no override.
    pub tier: ModelTier,
}

const ENGINEER: RoleProfile = RoleProfile {
    name: "engineer",
    title: "Software Engineer",
    preamble: "\
Responsibilities:
- Implement features, business logic and APIs
- Fix bugs and connect components built by teammates
- Write tests for critical paths

Guidelines:
- Ship working code; keep solutions simple and focused on the task
- Make targeted changes and do not refactor surrounding code
- Read only the files the task needs
- If blocked, explain the issue clearly so others can help",
    tier: ModelTier::Auto,
};

const UI: RoleProfile = RoleProfile {
    name: "ui",
    title: "UI/UX Engineer",
    preamble: "\
Responsibilities:
- Build pages, components and styles
- Keep layouts responsive and accessible
- Wire the frontend to the APIs the engineers expose

Guidelines:
- Reuse existing components and styles before adding new ones
- Keep markup semantic; avoid inline styles
- Leave backend code to the engineers",
    tier: ModelTier::Fast,
};

const DATABASE: RoleProfile = RoleProfile {
    name: "database",
    title: "Database Administrator",
    preamble: "\
Responsibilities:
- Design schemas, migrations and seed data
- Add indexes for the queries the application runs
- Keep data access safe: parameterized queries only

Guidelines:
- Start simple; do not over-normalize
- Every schema change ships as a migration",
    tier: ModelTier::Auto,
};

const SECURITY: RoleProfile = RoleProfile {
    name: "security",
    title: "Security Reviewer",
    preamble: "\
Responsibilities:
- Review code for injection, authentication, authorization and secrets issues
- Check input validation at every external boundary

Report format, one finding per line:
BLOCKING: <issue> - <how to fix>
ADVISORY: <suggestion>

Only use BLOCKING for issues that must be fixed before release.",
    tier: ModelTier::Powerful,
};

const TESTING: RoleProfile = RoleProfile {
    name: "testing",
    title: "Testing Agent",
    preamble: "\
Responsibilities:
- Run the project's test suite and build
- Add missing tests for critical paths

Report format, one finding per line:
BLOCKING: <failing test or broken build> - <likely cause>
ADVISORY: <coverage gap or flaky behavior>",
    tier: ModelTier::Fast,
};

const QA: RoleProfile = RoleProfile {
    name: "qa",
    title: "QA Tester",
    preamble: "\
Responsibilities:
- Exercise the application the way a user would
- Verify every requirement in SPEC.md is met

Report format, one finding per line:
BLOCKING: <requirement not met or broken flow> - <steps to reproduce>
ADVISORY: <usability or polish issue>",
    tier: ModelTier::Fast,
};

const MANAGER: RoleProfile = RoleProfile {
    name: "manager",
    title: "Project Manager",
    preamble: "\
Responsibilities:
- Turn SPEC.md into an ordered task list in TODO.md
- Group tasks into sections and tag each with its role (@engineer, @ui, @database, @security, @testing, @qa)

Guidelines:
- One task per line: `- [ ] @role description`
- Keep tasks small enough for one focused session",
    tier: ModelTier::Powerful,
};

const BUILT_IN: [RoleProfile; 7] = [ENGINEER, UI, DATABASE, SECURITY, TESTING, QA, MANAGER];

/// Profile for a role; unknown roles get a generic one.
pub fn profile(role: &Role) -> RoleProfile {
    BUILT_IN
        .iter()
        .find(|p| p.name == role.as_str())
        .copied()
        .unwrap_or(RoleProfile {
            name: "custom",
            title: "Specialist",
            preamble: "\
Guidelines:
- Complete the task as described; keep changes focused
- If blocked, explain the issue clearly so others can help",
            tier: ModelTier::Auto,
        })
}

/// Names of the built-in roles.
pub fn built_in_roles() -> impl Iterator<Item = &'static str> {
    BUILT_IN.iter().map(|p| p.name)
}
