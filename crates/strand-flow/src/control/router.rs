use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use strand_core::error::{Result, StrandError};
use strand_core::io::{StepInput, StepOutput};

use crate::context::RunContext;
use crate::sequence::run_steps;
use crate::step::Step;

/// Handle to one of a router's declared choices.
///
/// Only obtainable from `Choices`, and tagged with the set that issued it, so
/// a selector cannot route to a step the router does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Choice {
    owner: u64,
    index: usize,
}

impl Choice {
    pub fn index(&self) -> usize {
        self.index
    }
}

static NEXT_CHOICES_ID: AtomicU64 = AtomicU64::new(1);

/// The steps a router may pick from.
#[derive(Debug, Clone)]
pub struct Choices {
    id: u64,
    steps: Vec<Step>,
}

impl Choices {
    fn new(steps: Vec<Step>) -> Self {
        Self {
            id: NEXT_CHOICES_ID.fetch_add(1, Ordering::Relaxed),
            steps,
        }
    }

    fn choice(&self, index: usize) -> Choice {
        Choice {
            owner: self.id,
            index,
        }
    }

    pub fn by_name(&self, name: &str) -> Option<Choice> {
        self.steps
            .iter()
            .position(|s| s.name() == name)
            .map(|i| self.choice(i))
    }

    pub fn at(&self, index: usize) -> Option<Choice> {
        (index < self.steps.len()).then(|| self.choice(index))
    }

    pub fn all(&self) -> Vec<Choice> {
        (0..self.steps.len()).map(|i| self.choice(i)).collect()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// The step behind `choice`, or `None` if another set issued it.
    pub fn get(&self, choice: Choice) -> Option<&Step> {
        if choice.owner != self.id {
            return None;
        }
        self.steps.get(choice.index)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

type Selector = Arc<
    dyn Fn(&StepInput, &Choices) -> std::result::Result<Vec<Choice>, String> + Send + Sync,
>;

/// Picks which of its choices to run, based on the input.
///
/// The selector runs once per execution. Chosen steps run as a chained
/// sub-sequence in the order returned. Selecting nothing is an error.
pub struct Router {
    name: String,
    description: Option<String>,
    choices: Choices,
    selector: Selector,
}

impl Router {
    pub fn new<F>(name: impl Into<String>, choices: Vec<Step>, selector: F) -> Self
    where
        F: Fn(&StepInput, &Choices) -> Vec<Choice> + Send + Sync + 'static,
    {
        Self::try_new(name, choices, move |input: &StepInput, choices: &Choices| {
            Ok::<_, std::convert::Infallible>(selector(input, choices))
        })
    }

    pub fn try_new<F, E>(name: impl Into<String>, choices: Vec<Step>, selector: F) -> Self
    where
        F: Fn(&StepInput, &Choices) -> std::result::Result<Vec<Choice>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self {
            name: name.into(),
            description: None,
            choices: Choices::new(choices),
            selector: Arc::new(move |input: &StepInput, choices: &Choices| {
                selector(input, choices).map_err(|e| e.to_string())
            }),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn choices(&self) -> &Choices {
        &self.choices
    }

    /// Run the selector and resolve its picks to steps.
    pub fn select(&self, input: &StepInput) -> Result<Vec<Step>> {
        let picked = (self.selector)(input, &self.choices)
            .map_err(|e| StrandError::evaluator(&self.name, e))?;

        if picked.is_empty() {
            return Err(StrandError::RouterSelection {
                router: self.name.clone(),
                message: "selector chose no steps".to_string(),
            });
        }

        picked
            .into_iter()
            .map(|choice| {
                self.choices.get(choice).cloned().ok_or_else(|| StrandError::RouterSelection {
                    router: self.name.clone(),
                    message: format!("choice {} is not one of this router's steps", choice.index),
                })
            })
            .collect()
    }

    pub async fn execute(&self, input: &StepInput, ctx: &RunContext) -> Result<Vec<StepOutput>> {
        let chosen = self.select(input)?;
        info!(
            router = %self.name,
            chosen = ?chosen.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Router selected steps"
        );

        Ok(run_steps(&chosen, input.clone(), ctx).await?.outputs)
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("name", &self.name)
            .field("choices", &self.choices.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;

    fn topic_router() -> Router {
        Router::new(
            "topic",
            vec![
                Task::from_fn("tech", |_: &StepInput| "Tech content").into(),
                Task::from_fn("general", |_: &StepInput| "General content").into(),
                Task::from_fn("summary", |i: &StepInput| {
                    format!("Summary of {}", i.previous_step_content.as_deref().unwrap_or("nothing"))
                })
                .into(),
            ],
            |input: &StepInput, choices: &Choices| {
                let first = if input.message_as_string().contains("rust") {
                    choices.by_name("tech")
                } else {
                    choices.by_name("general")
                };
                first.into_iter().chain(choices.by_name("summary")).collect()
            },
        )
    }

    #[tokio::test]
    async fn test_routes_by_input_and_chains() {
        let router = topic_router();
        let outputs = router
            .execute(&StepInput::new("rust async"), &RunContext::new("wf", "main"))
            .await
            .unwrap();
        let contents: Vec<_> = outputs.iter().map(|o| o.content.clone().unwrap()).collect();
        assert_eq!(contents, vec!["Tech content", "Summary of Tech content"]);

        let outputs = router
            .execute(&StepInput::new("gardening"), &RunContext::new("wf", "main"))
            .await
            .unwrap();
        assert_eq!(outputs[0].content.as_deref(), Some("General content"));
    }

    #[test]
    fn test_empty_selection_is_error() {
        let router = Router::new(
            "picky",
            vec![Task::from_fn("a", |_: &StepInput| "A").into()],
            |_: &StepInput, _: &Choices| Vec::new(),
        );
        let err = router.select(&StepInput::new("x")).unwrap_err();
        assert!(matches!(err, StrandError::RouterSelection { .. }));
    }

    #[test]
    fn test_foreign_choice_is_rejected() {
        let router = Router::new(
            "small",
            vec![Task::from_fn("a", |_: &StepInput| "A").into()],
            |_: &StepInput, _: &Choices| vec![topic_router().choices().at(2).unwrap()],
        );
        assert!(router.select(&StepInput::new("x")).is_err());
    }

    #[test]
    fn test_in_range_choice_from_another_router_is_rejected() {
        let other = Router::new(
            "other",
            vec![Task::from_fn("delete_everything", |_: &StepInput| "DELETED").into()],
            |_: &StepInput, choices: &Choices| choices.all(),
        );
        let foreign = other.choices().by_name("delete_everything").unwrap();
        assert_eq!(foreign.index(), 0);

        let mine = Router::new(
            "mine",
            vec![Task::from_fn("safe", |_: &StepInput| "SAFE").into()],
            move |_: &StepInput, _: &Choices| vec![foreign],
        );
        let err = mine.select(&StepInput::new("x")).unwrap_err();
        assert!(matches!(err, StrandError::RouterSelection { ref router, .. } if router == "mine"));
        assert!(mine.choices().get(foreign).is_none());
    }

    #[test]
    fn test_selector_error_is_evaluator_error() {
        let router = Router::try_new(
            "broken",
            vec![Task::from_fn("a", |_: &StepInput| "A").into()],
            |_: &StepInput, _: &Choices| Err::<Vec<Choice>, _>("no route"),
        );
        assert!(matches!(
            router.select(&StepInput::new("x")),
            Err(StrandError::Evaluator { .. })
        ));
    }

    #[test]
    fn test_choices_lookup() {
        let router = topic_router();
        let choices = router.choices();
        assert_eq!(choices.len(), 3);
        assert_eq!(choices.names(), vec!["tech", "general", "summary"]);
        assert_eq!(choices.by_name("general").map(|c| c.index()), Some(1));
        assert!(choices.at(3).is_none());
        assert_eq!(choices.all().len(), 3);
    }
}
