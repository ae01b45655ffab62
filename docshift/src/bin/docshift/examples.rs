use crate::commands::{resolve, rollback, run, status};

#[derive(Clone, Copy)]
pub struct ExampleGroup {
    pub title: &'static str,
    pub commands: &'static [&'static str],
}

#[derive(Clone, Copy)]
pub struct CommandExample {
    pub name: &'static str,
    pub groups: &'static [ExampleGroup],
}

pub fn command_examples() -> &'static [CommandExample] {
    &[
        CommandExample {
            name: "run",
            groups: run::EXAMPLES,
        },
        CommandExample {
            name: "status",
            groups: status::STATUS_EXAMPLES,
        },
        CommandExample {
            name: "validate",
            groups: status::VALIDATE_EXAMPLES,
        },
        CommandExample {
            name: "rollback",
            groups: rollback::EXAMPLES,
        },
        CommandExample {
            name: "resolve",
            groups: resolve::EXAMPLES,
        },
    ]
}
