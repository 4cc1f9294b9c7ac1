//! Text format for mass-action models, used by the bundled presets and the
//! test-suite. Species initializers are `name = value;` lines and reactions
//! are `reactants -> products : rate;` with an optional rate (default 1).
//! Species mentioned only inside reactions start at zero.

use nom::{
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric0, digit0, multispace0},
    combinator::{opt, recognize},
    multi::{many0, separated_list0},
    number::complete::double,
    sequence::{delimited, pair, separated_pair, terminated},
    IResult,
};

use crate::model::{Model, ParamRef};

/// Rejected model text.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseError {
    /// A species was initialized twice.
    DuplicateSpecies(String),
    /// Leftover input that matched neither an initializer nor a reaction.
    TrailingInput(String),
    /// A reactant or product count failed to parse.
    InvalidCount(String),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::DuplicateSpecies(name) => write!(f, "species {name} declared twice"),
            ParseError::TrailingInput(rest) => write!(f, "could not parse: {rest}"),
            ParseError::InvalidCount(token) => write!(f, "invalid species count: {token}"),
        }
    }
}

impl std::error::Error for ParseError {}

fn species_name(input: &str) -> IResult<&str, &str> {
    delimited(
        multispace0,
        recognize(pair(alpha1, alphanumeric0)),
        multispace0,
    )(input)
}

fn parse_count(input: &str) -> IResult<&str, (&str, f64)> {
    delimited(
        multispace0,
        terminated(
            separated_pair(
                species_name,
                separated_pair(multispace0, tag("="), multispace0),
                double,
            ),
            tag(";"),
        ),
        multispace0,
    )(input)
}

fn parse_counts(input: &str) -> IResult<&str, Vec<(&str, f64)>> {
    many0(parse_count)(input)
}

fn parse_reactant(input: &str) -> IResult<&str, (&str, &str)> {
    delimited(multispace0, pair(digit0, species_name), multispace0)(input)
}

fn parse_reactants(input: &str) -> IResult<&str, Vec<(&str, &str)>> {
    delimited(
        multispace0,
        separated_list0(
            delimited(multispace0, tag("+"), multispace0),
            parse_reactant,
        ),
        multispace0,
    )(input)
}

type ReactionTokens<'a> = (
    (Vec<(&'a str, &'a str)>, Vec<(&'a str, &'a str)>),
    Option<f64>,
);

fn parse_reaction(input: &str) -> IResult<&str, ReactionTokens> {
    terminated(
        pair(
            separated_pair(parse_reactants, tag("->"), parse_reactants),
            opt(delimited(pair(tag(":"), multispace0), double, multispace0)),
        ),
        tag(";"),
    )(input)
}

fn parse_reactions(input: &str) -> IResult<&str, Vec<ReactionTokens>> {
    many0(parse_reaction)(input)
}

/// Builds a [`Model`] from model text: every reaction gets the mass-action
/// law implied by its reactants, and `affected_reactions` is precomputed.
pub fn model_from_str(input: &str) -> Result<Model, ParseError> {
    let (rest, counts) =
        parse_counts(input).map_err(|_| ParseError::TrailingInput(input.to_string()))?;
    let (rest, reactions) =
        parse_reactions(rest).map_err(|_| ParseError::TrailingInput(rest.to_string()))?;
    if !rest.trim().is_empty() {
        return Err(ParseError::TrailingInput(rest.trim().to_string()));
    }

    // Declared species first, in declaration order; then any species that
    // only shows up inside a reaction, starting at zero.
    let mut names: Vec<String> = Vec::new();
    let mut populations: Vec<f64> = Vec::new();
    for (name, value) in &counts {
        if names.iter().any(|n| n == name) {
            return Err(ParseError::DuplicateSpecies(name.to_string()));
        }
        names.push(name.to_string());
        populations.push(*value);
    }
    for ((reactants, products), _) in &reactions {
        for (_, name) in reactants.iter().chain(products) {
            if !names.iter().any(|n| n == name) {
                names.push(name.to_string());
                populations.push(0.0);
            }
        }
    }

    let species_names: Vec<&str> = names.iter().map(String::as_str).collect();
    let reaction_names: Vec<String> = (0..reactions.len()).map(|i| format!("r{i}")).collect();
    let reaction_names: Vec<&str> = reaction_names.iter().map(String::as_str).collect();
    let mut model = Model::build(&species_names, &populations, &reaction_names);

    for (r, ((reactants, products), rate)) in reactions.iter().enumerate() {
        for (count, name) in reactants {
            let s = model.species_id(name).unwrap_or_default();
            let count = parse_multiplicity(count)?;
            model.set_reactant(r, s, model.reactions[r].reactants_change[s] + count);
        }
        for (count, name) in products {
            let s = model.species_id(name).unwrap_or_default();
            let count = parse_multiplicity(count)?;
            model.set_product(r, s, model.reactions[r].products_change[s] + count);
        }
        model.set_mass_action(r, ParamRef::Literal(rate.unwrap_or(1.0)));
    }

    model.update_affected_reactions();
    Ok(model)
}

fn parse_multiplicity(token: &str) -> Result<i64, ParseError> {
    if token.is_empty() {
        return Ok(1);
    }
    token
        .parse()
        .map_err(|_| ParseError::InvalidCount(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_counts_and_reactions() {
        let model = model_from_str("A = 100; B = 3; 2A + B -> C : 0.5;").unwrap();
        assert_eq!(model.number_species(), 3);
        assert_eq!(model.number_reactions(), 1);
        assert_eq!(model.species[0].initial_population, 100.0);
        // C was never declared: implicit zero.
        assert_eq!(model.species[2].initial_population, 0.0);

        let r = &model.reactions[0];
        assert_eq!(r.reactants_change, vec![2, 1, 0]);
        assert_eq!(r.products_change, vec![0, 0, 1]);
        assert_eq!(r.species_change, vec![-2, -1, 1]);
    }

    #[test]
    fn rate_defaults_to_one() {
        let model = model_from_str("A = 1; A -> ;").unwrap();
        let params = model.load_parameters();
        let a = model.reactions[0].propensity(0.0, &[3.0], &params);
        assert_eq!(a, 3.0);
    }

    #[test]
    fn duplicate_species_is_rejected() {
        assert_eq!(
            model_from_str("A = 1; A = 2;"),
            Err(ParseError::DuplicateSpecies("A".into()))
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(
            model_from_str("A = 1; what is this"),
            Err(ParseError::TrailingInput(_))
        ));
    }
}
