use std::sync::Arc;

use bevy::{
    asset::RenderAssetUsages,
    mesh::{Indices, PrimitiveTopology},
    prelude::*,
    tasks::{AsyncComputeTaskPool, Task, block_on, futures_lite::future},
};

use crate::{
    error::Result,
    field::FieldGrid,
    march::polygonize,
    mesh::GeneratedMesh,
    metaballs::Metaballs,
    types::Point,
};

/// System sets for the metaball meshing pipeline.
///
/// Use these to order your own systems relative to mesh generation:
///
/// ```rust,ignore
/// // Run after geometry is ready but before it's uploaded — ideal for collider generation:
/// app.add_systems(Update, build_collider.after(MetaballsSet::Generate)
///                                       .before(MetaballsSet::Upload));
/// ```
///
/// ```text
/// MetaballsSet::Spawn  →  [async compute]  →  MetaballsSet::Generate  →  [your systems]  →  MetaballsSet::Upload
/// ```
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum MetaballsSet {
    /// Spawns an async compute task for each queued [`Metaballs`] entity.
    Spawn,
    /// Polls async tasks and inserts [`GeneratedMesh`] on completion.
    Generate,
    /// Uploads [`GeneratedMesh`] data into a Bevy [`Mesh3d`] and removes [`GeneratedMesh`].
    Upload,
}

/// Marker component added to [`Metaballs`] entities that are waiting to be processed.
///
/// Removed automatically once the entity's mesh has been generated and uploaded.
#[derive(Component)]
pub struct QueuedMetaballs;

/// Holds the in-flight async compute task for a [`Metaballs`] entity.
///
/// Inserted by [`MetaballsSet::Spawn`], removed once the task completes and
/// [`MetaballsSet::Generate`] has handled its result.
#[derive(Component)]
pub struct ComputeTask(Task<Result<GeneratedMesh>>);

/// Runtime configuration for the metaball meshing pipeline.
///
/// Inserted as a resource by [`MetaballsPlugin`]. Modify it at any time to change behaviour:
///
/// ```rust,ignore
/// app.add_plugins(MetaballsPlugin { max_tasks_per_frame: 8, ..default() });
///
/// // Or change it at runtime:
/// fn my_system(mut config: ResMut<MetaballsConfig>) {
///     config.max_tasks_per_frame = 1; // throttle while the player is in combat
/// }
/// ```
#[derive(Resource)]
pub struct MetaballsConfig {
    /// Maximum number of async mesh tasks spawned per frame.
    ///
    /// Higher values mesh queued entities faster but may cause frame hitches
    /// when many are queued at once. Default: `4`.
    pub max_tasks_per_frame: usize,
}

impl Default for MetaballsConfig {
    fn default() -> Self {
        Self {
            max_tasks_per_frame: 4,
        }
    }
}

/// Bevy plugin that drives metaball mesh generation.
///
/// When the `auto_queue` feature is enabled, any [`Metaballs`] added to the
/// world is automatically processed. The field sampling and marching cubes
/// pass run on Bevy's `AsyncComputeTaskPool`, so the main thread is never
/// blocked:
///
/// ```text
/// Metaballs added
///   → QueuedMetaballs inserted      (on_metaballs_add)
///   → ComputeTask spawned           (MetaballsSet::Spawn)
///   → [async compute runs]
///   → GeneratedMesh inserted        (MetaballsSet::Generate, once task completes)
///   → [your collider systems here]
///   → Mesh3d inserted               (MetaballsSet::Upload)
///   → QueuedMetaballs + GeneratedMesh removed
/// ```
pub struct MetaballsPlugin {
    /// Initial value for [`MetaballsConfig::max_tasks_per_frame`].
    pub max_tasks_per_frame: usize,
}

impl Default for MetaballsPlugin {
    fn default() -> Self {
        Self {
            max_tasks_per_frame: MetaballsConfig::default().max_tasks_per_frame,
        }
    }
}

impl Plugin for MetaballsPlugin {
    fn build(&self, app: &mut App) {
        app.insert_resource(MetaballsConfig {
            max_tasks_per_frame: self.max_tasks_per_frame,
        });

        #[cfg(feature = "auto_queue")]
        app.configure_sets(
            Update,
            (
                MetaballsSet::Spawn,
                MetaballsSet::Generate,
                MetaballsSet::Upload,
            )
                .chain(),
        )
        .add_systems(
            Update,
            (
                on_metaballs_add,
                spawn_mesh_tasks.in_set(MetaballsSet::Spawn),
                poll_mesh_tasks.in_set(MetaballsSet::Generate),
                upload_mesh.in_set(MetaballsSet::Upload),
            ),
        );
    }
}

/// Inserts [`QueuedMetaballs`] on every newly added [`Metaballs`] that doesn't already have it.
fn on_metaballs_add(
    mut commands: Commands,
    query: Query<Entity, (Added<Metaballs>, Without<QueuedMetaballs>)>,
) {
    for entity in query.iter() {
        commands.entity(entity).insert(QueuedMetaballs);
    }
}

/// Spawns async compute tasks for [`QueuedMetaballs`], up to [`MetaballsConfig::max_tasks_per_frame`] per frame.
///
/// `Without<ComputeTask>` keeps passes per entity strictly sequential; an
/// entity that already carries a [`Mesh3d`] is fair game, so re-inserting
/// [`QueuedMetaballs`] after an upload starts a fresh pass that replaces the
/// mesh.
fn spawn_mesh_tasks(
    mut commands: Commands,
    config: Res<MetaballsConfig>,
    query: Query<(Entity, &Metaballs), (With<QueuedMetaballs>, Without<ComputeTask>)>,
) {
    let task_pool = AsyncComputeTaskPool::get();

    for (entity, balls) in query.iter().take(config.max_tasks_per_frame) {
        // Arc::clone is a single pointer bump — no heap allocation on the main thread.
        let points: Arc<Vec<Point>> = Arc::clone(&balls.points);
        let resolution = balls.quality.resolution();
        let extent = balls.extent;
        let origin = balls.origin;
        let threshold = balls.threshold;

        let task = task_pool.spawn(async move {
            let mut grid = FieldGrid::new(resolution, extent, origin)?;
            grid.par_sample(&points);
            let vertices = polygonize(&grid, threshold);
            Ok(GeneratedMesh::build(vertices))
        });

        commands.entity(entity).insert(ComputeTask(task));
    }
}

/// Polls in-flight [`ComputeTask`]s each frame and inserts [`GeneratedMesh`] on completion.
///
/// Non-blocking: tasks that haven't finished are skipped and retried next
/// frame. A failed pass (grid allocation) is logged and the entity is
/// dequeued; the caller may re-add it at a lower quality tier.
fn poll_mesh_tasks(mut commands: Commands, mut query: Query<(Entity, &mut ComputeTask)>) {
    for (entity, mut compute_task) in query.iter_mut() {
        if let Some(result) = block_on(future::poll_once(&mut compute_task.0)) {
            match result {
                Ok(generated_mesh) => {
                    commands
                        .entity(entity)
                        .insert(generated_mesh)
                        .remove::<ComputeTask>();
                }
                Err(err) => {
                    error!("metaball mesh pass failed: {err}");
                    commands
                        .entity(entity)
                        .remove::<ComputeTask>()
                        .remove::<QueuedMetaballs>();
                }
            }
        }
    }
}

/// Uploads a [`GeneratedMesh`] into a Bevy [`Mesh3d`], then removes [`GeneratedMesh`] and [`QueuedMetaballs`].
///
/// The three vertex data Vecs are **moved** directly into the Bevy mesh with no copies.
fn upload_mesh(
    mut commands: Commands,
    mut query: Query<(Entity, &mut GeneratedMesh), With<QueuedMetaballs>>,
    mut meshes: ResMut<Assets<Mesh>>,
) {
    for (entity, mut generated) in query.iter_mut() {
        let mut bevy_mesh = Mesh::new(
            PrimitiveTopology::TriangleList,
            RenderAssetUsages::RENDER_WORLD,
        );

        // The component is removed below, so the buffers can be taken.
        bevy_mesh.insert_attribute(
            Mesh::ATTRIBUTE_POSITION,
            std::mem::take(&mut generated.vertices),
        );
        bevy_mesh.insert_attribute(
            Mesh::ATTRIBUTE_NORMAL,
            std::mem::take(&mut generated.normals),
        );
        bevy_mesh.insert_indices(Indices::U32(std::mem::take(&mut generated.indices)));

        commands
            .entity(entity)
            .insert(Mesh3d(meshes.add(bevy_mesh)))
            .remove::<GeneratedMesh>()
            .remove::<QueuedMetaballs>();
    }
}
